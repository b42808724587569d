//! In-process communication fabric
//!
//! [`LocalBackend::world`] creates one backend per rank over a shared
//! [`LocalFabric`]. Each rank is driven from its own thread. Collectives
//! meet in a round keyed by `(communicator, sequence)`: every rank drops its
//! contribution in, the last one to arrive computes the outcome and wakes
//! the rest. Point-to-point sends are buffered in per-pair mailboxes.
//!
//! Status codes mirror Open MPI's so errors read the same on either backend.

use super::{BuiltinDatatype, CommBackend, CommHandle, DatatypeHandle, OpHandle, RawHandle, SendBuffer, UserFunction, ANY_TAG};
use crate::error::{Error, Result};
use crate::kind::ReductionKind;
use crate::reduce::{self, Additive, Ordered};
use bytemuck::Pod;
use num_complex::Complex32;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub const ERR_COUNT: i32 = 2;
pub const ERR_TYPE: i32 = 3;
pub const ERR_TAG: i32 = 4;
pub const ERR_COMM: i32 = 5;
pub const ERR_RANK: i32 = 6;
pub const ERR_OP: i32 = 10;
pub const ERR_ARG: i32 = 13;
pub const ERR_TRUNCATE: i32 = 15;
pub const ERR_OTHER: i32 = 16;

const WORLD: RawHandle = 1;

/// State shared by every rank of one local world
#[derive(Debug)]
pub struct LocalFabric {
    size: usize,
    state: Mutex<FabricState>,
    changed: Condvar,
}

#[derive(Debug)]
struct FabricState {
    comms: HashMap<RawHandle, CommEntry>,
    next_comm: RawHandle,
    rounds: HashMap<(RawHandle, u64), Round>,
    mailboxes: HashMap<(RawHandle, usize, usize), VecDeque<Message>>,
}

#[derive(Debug)]
struct CommEntry {
    /// World rank of each communicator rank
    members: Vec<usize>,
    released: Vec<bool>,
}

#[derive(Debug)]
struct Message {
    tag: i32,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct Round {
    operation: &'static str,
    mismatched: bool,
    contributions: Vec<Option<Vec<u8>>>,
    arrived: usize,
    collected: usize,
    outcome: Option<Outcome>,
}

#[derive(Debug, Clone)]
enum Outcome {
    Bytes(Arc<[u8]>),
    /// New communicator per parent rank
    Split(Arc<[Option<RawHandle>]>),
    Failed(i32),
}

impl FabricState {
    /// Position of `world_rank` in `comm`, plus the member list
    fn membership(&self, comm: RawHandle, world_rank: usize) -> std::result::Result<(usize, Vec<usize>), i32> {
        let entry = self.comms.get(&comm).ok_or(ERR_COMM)?;
        let me = entry
            .members
            .iter()
            .position(|&m| m == world_rank)
            .ok_or(ERR_COMM)?;
        if entry.released[me] {
            return Err(ERR_COMM);
        }
        Ok((me, entry.members.clone()))
    }

    fn allocate_comm(&mut self, members: Vec<usize>) -> RawHandle {
        let id = self.next_comm;
        self.next_comm += 1;
        let released = vec![false; members.len()];
        self.comms.insert(id, CommEntry { members, released });
        id
    }
}

#[derive(Debug, Clone, Copy)]
enum DatatypeEntry {
    Builtin(BuiltinDatatype),
    Derived { extent: usize, committed: bool },
}

impl DatatypeEntry {
    fn extent(self) -> usize {
        match self {
            DatatypeEntry::Builtin(b) => b.size(),
            DatatypeEntry::Derived { extent, .. } => extent,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OpEntry {
    Builtin(ReductionKind),
    User(UserFunction),
}

#[derive(Debug, Default)]
struct LocalStats {
    init_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
    rank_queries: AtomicUsize,
    size_queries: AtomicUsize,
    splits: AtomicUsize,
    frees: AtomicUsize,
    types_created: AtomicUsize,
    ops_created: AtomicUsize,
    collectives: AtomicUsize,
}

/// Call counts of one local rank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalStatsSnapshot {
    pub init_calls: usize,
    pub finalize_calls: usize,
    pub rank_queries: usize,
    pub size_queries: usize,
    pub splits: usize,
    pub frees: usize,
    pub types_created: usize,
    pub ops_created: usize,
    /// Reductions, gathers, splits, sends and receives
    pub collectives: usize,
}

/// One rank of an in-process world
#[derive(Debug)]
pub struct LocalBackend {
    rank: usize,
    fabric: Arc<LocalFabric>,
    initialized: AtomicBool,
    finalized: AtomicBool,
    datatypes: Mutex<Vec<DatatypeEntry>>,
    ops: Mutex<Vec<OpEntry>>,
    sequences: Mutex<HashMap<RawHandle, u64>>,
    stats: LocalStats,
}

impl LocalBackend {
    /// Backends for ranks `0..size` of a new world
    pub fn world(size: usize) -> Vec<LocalBackend> {
        let mut comms = HashMap::new();
        comms.insert(
            WORLD,
            CommEntry {
                members: (0..size).collect(),
                released: vec![false; size],
            },
        );
        let fabric = Arc::new(LocalFabric {
            size,
            state: Mutex::new(FabricState {
                comms,
                next_comm: WORLD + 1,
                rounds: HashMap::new(),
                mailboxes: HashMap::new(),
            }),
            changed: Condvar::new(),
        });

        (0..size)
            .map(|rank| LocalBackend {
                rank,
                fabric: Arc::clone(&fabric),
                initialized: AtomicBool::new(false),
                finalized: AtomicBool::new(false),
                datatypes: Mutex::new(BuiltinDatatype::ALL.iter().map(|&b| DatatypeEntry::Builtin(b)).collect()),
                ops: Mutex::new(ReductionKind::ALL.iter().map(|&r| OpEntry::Builtin(r)).collect()),
                sequences: Mutex::new(HashMap::new()),
                stats: LocalStats::default(),
            })
            .collect()
    }

    /// Rank in the world communicator
    pub fn world_rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.fabric.size
    }

    pub fn stats(&self) -> LocalStatsSnapshot {
        let s = &self.stats;
        LocalStatsSnapshot {
            init_calls: s.init_calls.load(Ordering::Relaxed),
            finalize_calls: s.finalize_calls.load(Ordering::Relaxed),
            rank_queries: s.rank_queries.load(Ordering::Relaxed),
            size_queries: s.size_queries.load(Ordering::Relaxed),
            splits: s.splits.load(Ordering::Relaxed),
            frees: s.frees.load(Ordering::Relaxed),
            types_created: s.types_created.load(Ordering::Relaxed),
            ops_created: s.ops_created.load(Ordering::Relaxed),
            collectives: s.collectives.load(Ordering::Relaxed),
        }
    }

    fn ensure_active(&self, operation: &'static str) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) && !self.finalized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::comm(operation, ERR_OTHER))
        }
    }

    fn datatype(&self, operation: &'static str, handle: DatatypeHandle) -> Result<DatatypeEntry> {
        let entry = handle
            .as_raw()
            .checked_sub(1)
            .and_then(|i| self.datatypes.lock().get(i).copied())
            .ok_or(Error::comm(operation, ERR_TYPE))?;
        match entry {
            DatatypeEntry::Derived { committed: false, .. } => Err(Error::comm(operation, ERR_TYPE)),
            entry => Ok(entry),
        }
    }

    fn op(&self, operation: &'static str, handle: OpHandle) -> Result<OpEntry> {
        handle
            .as_raw()
            .checked_sub(1)
            .and_then(|i| self.ops.lock().get(i).copied())
            .ok_or(Error::comm(operation, ERR_OP))
    }

    fn byte_len(operation: &'static str, count: i32, extent: usize) -> Result<usize> {
        usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(extent))
            .ok_or(Error::comm(operation, ERR_COUNT))
    }

    fn next_sequence(&self, comm: RawHandle) -> u64 {
        let mut sequences = self.sequences.lock();
        let seq = sequences.entry(comm).or_insert(0);
        let current = *seq;
        *seq += 1;
        current
    }

    fn with_comm<T>(
        &self,
        operation: &'static str,
        comm: CommHandle,
        f: impl FnOnce(usize, &[usize]) -> T,
    ) -> Result<T> {
        self.ensure_active(operation)?;
        let state = self.fabric.state.lock();
        let (me, members) = state
            .membership(comm.as_raw(), self.rank)
            .map_err(|code| Error::comm(operation, code))?;
        Ok(f(me, &members))
    }

    /// Contribute `payload` to the next round on `comm` and wait for its outcome
    fn rendezvous<F>(&self, operation: &'static str, comm: CommHandle, payload: Vec<u8>, finish: F) -> Result<Outcome>
    where
        F: FnOnce(&mut FabricState, &[usize], Vec<Vec<u8>>) -> Outcome,
    {
        self.ensure_active(operation)?;
        self.stats.collectives.fetch_add(1, Ordering::Relaxed);

        let id = comm.as_raw();
        let mut state = self.fabric.state.lock();
        let (me, members) = state
            .membership(id, self.rank)
            .map_err(|code| Error::comm(operation, code))?;
        let key = (id, self.next_sequence(id));
        let n = members.len();

        let round = state.rounds.entry(key).or_insert_with(|| Round {
            operation,
            mismatched: false,
            contributions: vec![None; n],
            arrived: 0,
            collected: 0,
            outcome: None,
        });
        round.mismatched |= round.operation != operation;
        round.contributions[me] = Some(payload);
        round.arrived += 1;
        trace!(operation, comm = id, seq = key.1, arrived = round.arrived, of = n, "round contribution");

        if round.arrived == n {
            let mismatched = round.mismatched;
            let contributions: Vec<Vec<u8>> = round
                .contributions
                .iter_mut()
                .map(|c| c.take().unwrap_or_default())
                .collect();
            let outcome = if mismatched {
                Outcome::Failed(ERR_OTHER)
            } else {
                finish(&mut state, &members, contributions)
            };
            if let Some(round) = state.rounds.get_mut(&key) {
                round.outcome = Some(outcome);
            }
            self.fabric.changed.notify_all();
        }

        while !state.rounds.get(&key).is_some_and(|r| r.outcome.is_some()) {
            self.fabric.changed.wait(&mut state);
        }

        let (done, outcome) = match state.rounds.get_mut(&key) {
            Some(round) => {
                round.collected += 1;
                (round.collected == n, round.outcome.clone())
            }
            None => (false, None),
        };
        if done {
            state.rounds.remove(&key);
        }
        match outcome {
            Some(Outcome::Failed(code)) => Err(Error::comm(operation, code)),
            Some(outcome) => Ok(outcome),
            None => Err(Error::comm(operation, ERR_OTHER)),
        }
    }
}

/// Fold `input` into `acc` with a builtin reduction
fn native_reduce(
    datatype: BuiltinDatatype,
    reduction: ReductionKind,
    input: &[u8],
    acc: &mut [u8],
) -> std::result::Result<(), i32> {
    fn fold<T: Pod + Additive + Ordered>(
        reduction: ReductionKind,
        input: &[u8],
        acc: &mut [u8],
    ) -> std::result::Result<(), i32> {
        let incoming: Vec<T> = bytemuck::pod_collect_to_vec(input);
        let mut values: Vec<T> = bytemuck::pod_collect_to_vec(acc);
        let folded = match reduction {
            ReductionKind::Sum => reduce::accumulate_slice::<T, reduce::Sum>(&incoming, &mut values),
            ReductionKind::Max => reduce::accumulate_slice::<T, reduce::Max>(&incoming, &mut values),
            ReductionKind::Min => reduce::accumulate_slice::<T, reduce::Min>(&incoming, &mut values),
        };
        folded.map_err(|_| ERR_COUNT)?;
        acc.copy_from_slice(bytemuck::cast_slice(&values));
        Ok(())
    }

    match datatype {
        // Arithmetic and ordering operators are invalid on booleans.
        BuiltinDatatype::Bool => Err(ERR_OP),
        BuiltinDatatype::Int8 => fold::<i8>(reduction, input, acc),
        BuiltinDatatype::UInt8 => fold::<u8>(reduction, input, acc),
        BuiltinDatatype::Int16 => fold::<i16>(reduction, input, acc),
        BuiltinDatatype::UInt16 => fold::<u16>(reduction, input, acc),
        BuiltinDatatype::Int32 => fold::<i32>(reduction, input, acc),
        BuiltinDatatype::UInt32 => fold::<u32>(reduction, input, acc),
        BuiltinDatatype::Int64 => fold::<i64>(reduction, input, acc),
        BuiltinDatatype::UInt64 => fold::<u64>(reduction, input, acc),
        BuiltinDatatype::Float32 => fold::<f32>(reduction, input, acc),
        BuiltinDatatype::Float64 => fold::<f64>(reduction, input, acc),
        // Complex has no native order.
        BuiltinDatatype::Complex64 => match reduction {
            ReductionKind::Sum => fold::<Complex32>(reduction, input, acc),
            ReductionKind::Max | ReductionKind::Min => Err(ERR_OP),
        },
    }
}

/// Reduce contributions in rank order
fn reduce_round(
    datatype: DatatypeEntry,
    datatype_handle: DatatypeHandle,
    op: OpEntry,
    count: i32,
    mut contributions: Vec<Vec<u8>>,
) -> Outcome {
    if contributions.windows(2).any(|w| w[0].len() != w[1].len()) {
        return Outcome::Failed(ERR_COUNT);
    }
    let mut iter = contributions.drain(..);
    let Some(mut acc) = iter.next() else {
        return Outcome::Failed(ERR_COMM);
    };
    for mut incoming in iter {
        let step = match (op, datatype) {
            (OpEntry::Builtin(reduction), DatatypeEntry::Builtin(builtin)) => {
                native_reduce(builtin, reduction, &incoming, &mut acc)
            }
            (OpEntry::Builtin(_), DatatypeEntry::Derived { .. }) => Err(ERR_OP),
            (OpEntry::User(function), _) => {
                let mut len: c_int = count;
                let mut raw = datatype_handle.as_raw();
                // SAFETY: both buffers hold `count` elements of the datatype.
                unsafe {
                    function(
                        incoming.as_mut_ptr().cast(),
                        acc.as_mut_ptr().cast(),
                        &mut len,
                        &mut raw,
                    )
                };
                Ok(())
            }
        };
        if let Err(code) = step {
            return Outcome::Failed(code);
        }
    }
    Outcome::Bytes(acc.into())
}

/// Partition `members` by color, ordering each part by `(key, parent rank)`
fn split_round(state: &mut FabricState, members: &[usize], contributions: Vec<Vec<u8>>) -> Outcome {
    let mut requests = Vec::with_capacity(contributions.len());
    for (parent_rank, bytes) in contributions.iter().enumerate() {
        let Ok(pair) = <[u8; 8]>::try_from(bytes.as_slice()) else {
            return Outcome::Failed(ERR_ARG);
        };
        let color = i32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let key = i32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
        requests.push((color, key, parent_rank));
    }

    let mut colors: Vec<i32> = requests.iter().map(|r| r.0).filter(|&c| c >= 0).collect();
    colors.sort_unstable();
    colors.dedup();

    let mut assigned = vec![None; members.len()];
    for color in colors {
        let mut part: Vec<(i32, usize)> = requests
            .iter()
            .filter(|r| r.0 == color)
            .map(|r| (r.1, r.2))
            .collect();
        part.sort_unstable();
        let id = state.allocate_comm(part.iter().map(|&(_, parent)| members[parent]).collect());
        for (_, parent) in part {
            assigned[parent] = Some(id);
        }
    }
    Outcome::Split(assigned.into())
}

impl CommBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn init(&self) -> Result<()> {
        self.stats.init_calls.fetch_add(1, Ordering::Relaxed);
        if self.finalized.load(Ordering::Acquire) || self.initialized.swap(true, Ordering::AcqRel) {
            return Err(Error::comm("init", ERR_OTHER));
        }
        debug!(rank = self.rank, size = self.fabric.size, "local rank initialized");
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        self.stats.finalize_calls.fetch_add(1, Ordering::Relaxed);
        self.ensure_active("finalize")?;
        self.finalized.store(true, Ordering::Release);
        debug!(rank = self.rank, "local rank finalized");
        Ok(())
    }

    fn world(&self) -> CommHandle {
        CommHandle::from_raw(WORLD)
    }

    fn builtin_datatype(&self, datatype: BuiltinDatatype) -> DatatypeHandle {
        DatatypeHandle::from_raw(datatype as usize + 1)
    }

    fn builtin_op(&self, reduction: ReductionKind) -> OpHandle {
        let index = match reduction {
            ReductionKind::Sum => 0,
            ReductionKind::Max => 1,
            ReductionKind::Min => 2,
        };
        OpHandle::from_raw(index + 1)
    }

    fn type_contiguous(&self, count: i32, base: DatatypeHandle) -> Result<DatatypeHandle> {
        self.ensure_active("type_contiguous")?;
        let base = self.datatype("type_contiguous", base)?;
        let extent = Self::byte_len("type_contiguous", count, base.extent())?;
        let mut datatypes = self.datatypes.lock();
        datatypes.push(DatatypeEntry::Derived {
            extent,
            committed: false,
        });
        self.stats.types_created.fetch_add(1, Ordering::Relaxed);
        Ok(DatatypeHandle::from_raw(datatypes.len()))
    }

    fn type_commit(&self, datatype: DatatypeHandle) -> Result<DatatypeHandle> {
        self.ensure_active("type_commit")?;
        let mut datatypes = self.datatypes.lock();
        match datatype.as_raw().checked_sub(1).and_then(|i| datatypes.get_mut(i)) {
            Some(DatatypeEntry::Derived { committed, .. }) => {
                *committed = true;
                Ok(datatype)
            }
            Some(DatatypeEntry::Builtin(_)) => Ok(datatype),
            None => Err(Error::comm("type_commit", ERR_TYPE)),
        }
    }

    fn op_create(&self, function: UserFunction, commute: bool) -> Result<OpHandle> {
        self.ensure_active("op_create")?;
        let mut ops = self.ops.lock();
        ops.push(OpEntry::User(function));
        self.stats.ops_created.fetch_add(1, Ordering::Relaxed);
        trace!(rank = self.rank, commute, handle = ops.len(), "user op registered");
        Ok(OpHandle::from_raw(ops.len()))
    }

    fn comm_rank(&self, comm: CommHandle) -> Result<i32> {
        self.stats.rank_queries.fetch_add(1, Ordering::Relaxed);
        self.with_comm("comm_rank", comm, |me, _| me as i32)
    }

    fn comm_size(&self, comm: CommHandle) -> Result<i32> {
        self.stats.size_queries.fetch_add(1, Ordering::Relaxed);
        self.with_comm("comm_size", comm, |_, members| members.len() as i32)
    }

    fn comm_split(&self, comm: CommHandle, color: i32, key: i32) -> Result<CommHandle> {
        self.stats.splits.fetch_add(1, Ordering::Relaxed);
        let mut payload = color.to_le_bytes().to_vec();
        payload.extend_from_slice(&key.to_le_bytes());

        let me = self.with_comm("comm_split", comm, |me, _| me)?;
        match self.rendezvous("comm_split", comm, payload, split_round)? {
            Outcome::Split(assigned) => assigned
                .get(me)
                .copied()
                .flatten()
                .map(CommHandle::from_raw)
                .ok_or(Error::comm("comm_split", ERR_ARG)),
            _ => Err(Error::comm("comm_split", ERR_OTHER)),
        }
    }

    fn comm_free(&self, comm: CommHandle) -> Result<()> {
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
        self.ensure_active("comm_free")?;
        if comm.as_raw() == WORLD {
            return Err(Error::comm("comm_free", ERR_COMM));
        }
        let mut state = self.fabric.state.lock();
        let (me, _) = state
            .membership(comm.as_raw(), self.rank)
            .map_err(|code| Error::comm("comm_free", code))?;
        let remove = match state.comms.get_mut(&comm.as_raw()) {
            Some(entry) => {
                entry.released[me] = true;
                entry.released.iter().all(|&r| r)
            }
            None => false,
        };
        if remove {
            state.comms.remove(&comm.as_raw());
        }
        Ok(())
    }

    unsafe fn all_reduce(
        &self,
        send: SendBuffer,
        recv: *mut c_void,
        count: i32,
        datatype: DatatypeHandle,
        op: OpHandle,
        comm: CommHandle,
    ) -> Result<()> {
        self.ensure_active("all_reduce")?;
        let entry = self.datatype("all_reduce", datatype)?;
        let op_entry = self.op("all_reduce", op)?;
        let len = Self::byte_len("all_reduce", count, entry.extent())?;

        let source = match send {
            SendBuffer::InPlace => recv as *const u8,
            SendBuffer::Buffer(ptr) => ptr as *const u8,
        };
        let payload = std::slice::from_raw_parts(source, len).to_vec();

        let outcome = self.rendezvous("all_reduce", comm, payload, |_, _, contributions| {
            reduce_round(entry, datatype, op_entry, count, contributions)
        })?;
        match outcome {
            Outcome::Bytes(bytes) if bytes.len() == len => {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), recv as *mut u8, len);
                Ok(())
            }
            _ => Err(Error::comm("all_reduce", ERR_COUNT)),
        }
    }

    unsafe fn all_gather(
        &self,
        send: *const c_void,
        count: i32,
        datatype: DatatypeHandle,
        recv: *mut c_void,
        comm: CommHandle,
    ) -> Result<()> {
        self.ensure_active("all_gather")?;
        let entry = self.datatype("all_gather", datatype)?;
        let len = Self::byte_len("all_gather", count, entry.extent())?;
        let payload = std::slice::from_raw_parts(send as *const u8, len).to_vec();

        let outcome = self.rendezvous("all_gather", comm, payload, |_, _, contributions| {
            if contributions.iter().any(|c| c.len() != len) {
                Outcome::Failed(ERR_COUNT)
            } else {
                Outcome::Bytes(contributions.concat().into())
            }
        })?;
        match outcome {
            Outcome::Bytes(bytes) => {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), recv as *mut u8, bytes.len());
                Ok(())
            }
            _ => Err(Error::comm("all_gather", ERR_OTHER)),
        }
    }

    unsafe fn send(
        &self,
        buf: *const c_void,
        count: i32,
        datatype: DatatypeHandle,
        dest: i32,
        tag: i32,
        comm: CommHandle,
    ) -> Result<()> {
        self.ensure_active("send")?;
        self.stats.collectives.fetch_add(1, Ordering::Relaxed);
        if tag < 0 {
            return Err(Error::comm("send", ERR_TAG));
        }
        let entry = self.datatype("send", datatype)?;
        let len = Self::byte_len("send", count, entry.extent())?;
        let bytes = std::slice::from_raw_parts(buf as *const u8, len).to_vec();

        let mut state = self.fabric.state.lock();
        let (me, members) = state
            .membership(comm.as_raw(), self.rank)
            .map_err(|code| Error::comm("send", code))?;
        let dest = usize::try_from(dest)
            .ok()
            .filter(|&d| d < members.len())
            .ok_or(Error::comm("send", ERR_RANK))?;
        state
            .mailboxes
            .entry((comm.as_raw(), me, dest))
            .or_default()
            .push_back(Message { tag, bytes });
        self.fabric.changed.notify_all();
        Ok(())
    }

    unsafe fn recv(
        &self,
        buf: *mut c_void,
        count: i32,
        datatype: DatatypeHandle,
        source: i32,
        tag: i32,
        comm: CommHandle,
    ) -> Result<()> {
        self.ensure_active("recv")?;
        self.stats.collectives.fetch_add(1, Ordering::Relaxed);
        let entry = self.datatype("recv", datatype)?;
        let capacity = Self::byte_len("recv", count, entry.extent())?;

        let mut state = self.fabric.state.lock();
        let (me, members) = state
            .membership(comm.as_raw(), self.rank)
            .map_err(|code| Error::comm("recv", code))?;
        let source = usize::try_from(source)
            .ok()
            .filter(|&s| s < members.len())
            .ok_or(Error::comm("recv", ERR_RANK))?;

        let key = (comm.as_raw(), source, me);
        let message = loop {
            let found = state.mailboxes.get_mut(&key).and_then(|queue| {
                queue
                    .iter()
                    .position(|m| tag == ANY_TAG || m.tag == tag)
                    .and_then(|i| queue.remove(i))
            });
            match found {
                Some(message) => break message,
                None => self.fabric.changed.wait(&mut state),
            }
        };
        drop(state);

        if message.bytes.len() > capacity {
            return Err(Error::comm("recv", ERR_TRUNCATE));
        }
        std::ptr::copy_nonoverlapping(message.bytes.as_ptr(), buf as *mut u8, message.bytes.len());
        Ok(())
    }
}
