//! Ordered execution streams
//!
//! A [`Stream`] owns one worker thread that runs enqueued tasks strictly in
//! enqueue order. Tasks from any thread may be enqueued; distinct streams run
//! concurrently. A failing task does not stop the stream: its error is kept
//! (first one wins) and handed back by [`Stream::synchronize`].

use crate::encoder::CommandEncoder;
use crate::error::{Error, Result};
use crossbeam::channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Deferred unit of work
pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Message {
    Run(Task),
    Flush(Sender<()>),
}

/// FIFO task queue drained by a dedicated worker thread
pub struct Stream {
    name: String,
    sender: Option<Sender<Message>>,
    worker: Option<JoinHandle<()>>,
    first_error: Arc<Mutex<Option<Error>>>,
}

impl Stream {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = unbounded::<Message>();
        let first_error = Arc::new(Mutex::new(None));

        let errors = Arc::clone(&first_error);
        let stream_name = name.clone();
        let worker = thread::Builder::new()
            .name(format!("hologram-stream-{name}"))
            .spawn(move || {
                for message in receiver.iter() {
                    match message {
                        Message::Run(task) => {
                            if let Err(err) = task() {
                                error!(stream = %stream_name, error = %err, "deferred operation failed");
                                errors.lock().get_or_insert(err);
                            }
                        }
                        Message::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                debug!(stream = %stream_name, "stream worker exiting");
            })
            .map_err(|err| {
                debug!(stream = %name, error = %err, "failed to spawn stream worker");
                Error::StreamClosed(name.clone())
            })?;

        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
            first_error,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `task` behind everything already enqueued
    pub fn enqueue(&self, task: Task) -> Result<()> {
        self.sender
            .as_ref()
            .and_then(|sender| sender.send(Message::Run(task)).ok())
            .ok_or_else(|| Error::StreamClosed(self.name.clone()))
    }

    /// Wait for every task enqueued so far and return the first error any of them raised
    pub fn synchronize(&self) -> Result<()> {
        let (ack, done) = bounded(1);
        let sent = self
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(Message::Flush(ack)).is_ok());
        if !sent || done.recv().is_err() {
            return Err(Error::StreamClosed(self.name.clone()));
        }
        match self.first_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Encoder for dispatching array operations onto this stream
    pub fn encoder(&self) -> CommandEncoder<'_> {
        CommandEncoder::new(self)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(stream = %self.name, "stream worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("name", &self.name).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_run_in_enqueue_order() {
        let stream = Stream::new("order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let log = Arc::clone(&log);
            stream
                .enqueue(Box::new(move || {
                    log.lock().push(i);
                    Ok(())
                }))
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn synchronize_returns_first_error_once() {
        let stream = Stream::new("errors").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        stream.enqueue(Box::new(|| Err(Error::comm("all_sum", 5)))).unwrap();
        stream.enqueue(Box::new(|| Err(Error::comm("all_max", 6)))).unwrap();
        let counter = Arc::clone(&ran);
        stream
            .enqueue(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        assert_eq!(stream.synchronize(), Err(Error::comm("all_sum", 5)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(stream.synchronize(), Ok(()));
    }

    #[test]
    fn drop_drains_queued_tasks() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let stream = Stream::new("drain").unwrap();
            for _ in 0..8 {
                let ran = Arc::clone(&ran);
                stream
                    .enqueue(Box::new(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }))
                    .unwrap();
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn panicked_worker_reports_closed() {
        let stream = Stream::new("panics").unwrap();
        stream
            .enqueue(Box::new(|| -> Result<()> { panic!("task panicked") }))
            .unwrap();
        assert_eq!(stream.synchronize(), Err(Error::StreamClosed("panics".into())));
        assert!(stream.enqueue(Box::new(|| Ok(()))).is_err());
    }
}
