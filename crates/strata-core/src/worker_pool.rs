use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The task panicked, or the pool shut down before running it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("worker task panicked or was dropped before completing")]
pub struct TaskAborted;

/// A fixed set of named threads draining one shared job queue.
///
/// Dropping the pool lets queued jobs finish, then joins every thread. A job that panics is logged and does not take
/// its thread down with it.
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, num_threads: usize) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let threads = (0..num_threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || worker_loop(receiver))
            })
            .collect::<io::Result<Vec<_>>>()?;
        log::debug!("Started worker pool {} with {} threads", name, threads.len());

        Ok(Self {
            name: name.to_owned(),
            sender: Some(sender),
            threads,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let sent = self
            .sender
            .as_ref()
            .map_or(false, |s| s.send(Box::new(job)).is_ok());
        if !sent {
            log::error!("Worker pool {} is shut down; dropping job", self.name);
        }
    }

    /// Runs `job` on the pool and hands its output back through a [`TaskHandle`].
    pub fn spawn_with_result<T: Send + 'static>(
        &self,
        job: impl FnOnce() -> T + Send + 'static,
    ) -> TaskHandle<T> {
        let (tx, rx) = bounded(1);
        self.spawn(move || {
            // The receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(job());
        });
        TaskHandle { receiver: rx }
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<non-string panic payload>".to_owned());
            log::error!(
                "Job panicked on {}: {}",
                thread::current().name().unwrap_or("<unnamed>"),
                message
            );
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Disconnect the queue so workers exit once it drains.
        self.sender.take();
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            // A pool can be dropped from one of its own jobs; that thread exits on its own.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("Worker thread of pool {} panicked", self.name);
            }
        }
    }
}

/// Receives the output of a job started with [`WorkerPool::spawn_with_result`].
pub struct TaskHandle<T> {
    receiver: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the job finishes.
    pub fn join(self) -> Result<T, TaskAborted> {
        self.receiver.recv().map_err(|_| TaskAborted)
    }

    pub fn try_join(&self) -> Option<Result<T, TaskAborted>> {
        match self.receiver.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => Some(Err(TaskAborted)),
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn results_come_back_from_workers() {
        let pool = WorkerPool::new("test", 3).unwrap();
        assert_eq!(pool.num_threads(), 3);
        let handles: Vec<_> = (0..16).map(|i| pool.spawn_with_result(move || i * i)).collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, (0..16).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_job_aborts_only_its_handle() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let failed = pool.spawn_with_result(|| -> u32 { panic!("boom") });
        assert_eq!(failed.join(), Err(TaskAborted));

        // The single worker survived the panic.
        let ok = pool.spawn_with_result(|| 5u32);
        assert_eq!(ok.join(), Ok(5));
    }

    #[test]
    fn drop_drains_queued_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new("test", 2).unwrap();
            for _ in 0..100 {
                let counter = counter.clone();
                pool.spawn(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }
}
