//! Command encoder for stream-ordered array operations

use crate::array::Array;
use crate::error::Result;
use crate::stream::Stream;

/// Records the arrays an operation touches and enqueues it on a stream
///
/// Outputs are marked pending from [`dispatch`](Self::dispatch) until the
/// operation has run (or was dropped unrun), so reads through
/// [`Array::wait`] observe its writes.
pub struct CommandEncoder<'s> {
    stream: &'s Stream,
    inputs: Vec<Array>,
    outputs: Vec<Array>,
}

impl<'s> CommandEncoder<'s> {
    pub(crate) fn new(stream: &'s Stream) -> Self {
        Self {
            stream,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn set_input_array(&mut self, array: &Array) -> &mut Self {
        self.inputs.push(array.clone());
        self
    }

    pub fn set_output_array(&mut self, array: &Array) -> &mut Self {
        self.outputs.push(array.clone());
        self
    }

    /// Enqueue `op`; the recorded arrays stay alive until it has run
    pub fn dispatch<F>(self, op: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        for output in &self.outputs {
            output.mark_pending();
        }
        let pending = PendingOp {
            op: Some(Box::new(op)),
            _inputs: self.inputs,
            outputs: self.outputs,
        };
        self.stream.enqueue(Box::new(move || pending.run()))
    }
}

/// Enqueued operation and the arrays it keeps alive
struct PendingOp {
    op: Option<Box<dyn FnOnce() -> Result<()> + Send>>,
    _inputs: Vec<Array>,
    outputs: Vec<Array>,
}

impl PendingOp {
    fn run(mut self) -> Result<()> {
        match self.op.take() {
            Some(op) => op(),
            None => Ok(()),
        }
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        for output in &self.outputs {
            output.complete_pending();
        }
    }
}
