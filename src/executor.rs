use std::sync::Arc;

use crate::engine::panic_message;

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs transformation work.
///
/// The coordinator hands every computation to an executor, so slow engines
/// and first-use compilation do not hold up the thread that delivers results
/// for other keys.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs every job right away on the calling thread.
#[derive(Debug, Copy, Clone, Default)]
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, job: Job) {
        job()
    }
}

impl Executor for rayon::ThreadPool {
    fn execute(&self, job: Job) {
        self.spawn(job)
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, job: Job) {
        (**self).execute(job)
    }
}

/// Build a worker pool with the given number of threads.
///
/// A job that panics is logged and dropped; the pool keeps running.
pub fn pool(workers: usize) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("transmemo-worker-{i}"))
        .panic_handler(|payload| {
            tracing::error!(message = %panic_message(payload.as_ref()), "worker job panicked");
        })
        .build()
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn test_pool_runs_jobs_off_thread() {
        let pool = pool(2).unwrap();
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || {
            tx.send(std::thread::current().id()).unwrap();
        }));
        assert_ne!(rx.recv().unwrap(), caller);
    }

    #[test]
    fn test_pool_survives_panicking_job() {
        let pool = pool(1).unwrap();
        pool.execute(Box::new(|| panic!("job blew up")));
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send("still running").unwrap()));
        assert_eq!(rx.recv(), Ok("still running"));
    }

    #[test]
    fn test_inline_runs_immediately() {
        let (tx, rx) = mpsc::channel();
        Inline.execute(Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.try_recv(), Ok(1));
    }
}
