//! The IO worker pool.
//!
//! Tessera's storage backends serve positional reads synchronously, so IO
//! parallelism comes from a small pool of dedicated blocking threads
//! rather than an async runtime. The orchestrating query submits one job
//! per coalesced byte range, keeps assembling the rest of the stage, and
//! blocks on the returned channels at the stage barrier.

use std::panic::resume_unwind;
use std::thread::JoinHandle;

use futures::channel::oneshot;
use tessera_error::{tessera_bail, TesseraExpect, TesseraResult};

type Job = Box<dyn FnOnce() + Send>;

/// A fixed pool of blocking IO threads fed through a shared queue.
#[derive(Debug)]
pub struct IoDispatcher {
    submitter: flume::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl IoDispatcher {
    pub fn new(num_threads: usize) -> Self {
        let (submitter, jobs) = flume::unbounded::<Job>();
        let workers = (0..num_threads)
            .map(|tid| {
                let jobs = jobs.clone();
                std::thread::Builder::new()
                    .name(format!("tessera-io-{tid}"))
                    .spawn(move || {
                        // Drain the shared queue until every submitter
                        // handle is gone.
                        while let Ok(job) = jobs.recv() {
                            job();
                        }
                    })
                    .tessera_expect("io worker thread spawn")
            })
            .collect();
        Self { submitter, workers }
    }

    /// Submit a blocking task; the receiver resolves with its output once
    /// a worker has run it.
    pub fn dispatch<F, R>(&self, task: F) -> TesseraResult<oneshot::Receiver<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            // The submitter may have dropped the receiver meanwhile.
            tx.send(task()).ok();
        });
        if self.submitter.send(job).is_err() {
            tessera_bail!("io dispatcher is shut down");
        }
        Ok(rx)
    }

    /// Drain outstanding work and join the workers.
    pub fn shutdown(self) -> TesseraResult<()> {
        drop(self.submitter);
        for worker in self.workers {
            worker.join().unwrap_or_else(|e| resume_unwind(e));
        }
        Ok(())
    }
}

impl Default for IoDispatcher {
    fn default() -> Self {
        Self::new(4)
    }
}
