//! Shared harness: one thread per rank over an in-process world.
#![allow(dead_code)]

use hologram_distributed::{Group, LocalBackend, Runtime, Stream};
use hologram_tracing::TracingConfig;
use std::sync::{Arc, Once};
use std::thread;

static TRACING: Once = Once::new();

/// Install the shared subscriber once per test binary; quiet unless overridden.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let config = TracingConfig {
            default_directive: "warn".to_string(),
            ..TracingConfig::from_env()
        };
        // Another harness may already own the global subscriber.
        let _ = hologram_tracing::init_global_tracing(&config);
    });
}

pub struct Rank {
    pub rank: usize,
    pub size: usize,
    pub backend: Arc<LocalBackend>,
    pub runtime: Runtime,
    pub world: Group,
    pub stream: Stream,
}

/// Run `f` on every rank of a fresh `size`-rank world and collect the results in rank order
pub fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Rank) -> T + Send + Sync + 'static,
{
    init_tracing();
    let f = Arc::new(f);
    let handles: Vec<_> = LocalBackend::world(size)
        .into_iter()
        .enumerate()
        .map(|(rank, backend)| {
            let f = Arc::clone(&f);
            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || {
                    let backend = Arc::new(backend);
                    let runtime = Runtime::new(backend.clone());
                    let world = runtime
                        .init(true)
                        .expect("local init succeeds")
                        .expect("world group");
                    let stream = Stream::new(format!("rank-{rank}")).expect("stream");
                    f(Rank {
                        rank,
                        size,
                        backend,
                        runtime,
                        world,
                        stream,
                    })
                })
                .expect("spawn rank thread")
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}
