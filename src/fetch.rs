// src/fetch.rs
//
//! Background fetch pool for double-buffered staging.
//!
//! While the consumer works through mini-batch `n`, the records for
//! mini-batch `n + 1` are produced on a worker pool. Work is keyed by a
//! buffer slot (0 or 1 in the double-buffered scheme, but any small integer
//! works); `take` blocks until the slot's job finishes, and returns `None`
//! if nothing was submitted so the caller can fall back to fetching inline.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Mutex;

use rayon::ThreadPool;

use crate::error::{Result, StageError};

pub struct FetchPool<T: Send + 'static> {
    pool: ThreadPool,
    pending: Mutex<HashMap<usize, mpsc::Receiver<Result<T>>>>,
}

impl<T: Send + 'static> FetchPool<T> {
    /// A pool with `threads` workers; 0 picks one worker per available core.
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("stage-fetch-{i}"))
            .build()
            .map_err(|e| StageError::ResourceExhausted(format!("fetch pool: {e}")))?;
        Ok(Self {
            pool,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Run `job` on the pool and file its result under `buffer`. A second
    /// submit to the same buffer before `take` is a caller bug.
    pub fn submit<F>(&self, buffer: usize, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| StageError::Invariant("fetch pool lock poisoned".to_string()))?;
        if pending.contains_key(&buffer) {
            return Err(StageError::Invariant(format!(
                "buffer {} already has a fetch in flight",
                buffer
            )));
        }
        let (tx, rx) = mpsc::channel();
        pending.insert(buffer, rx);
        self.pool.spawn(move || {
            // the receiver may have been dropped on shutdown
            let _ = tx.send(job());
        });
        Ok(())
    }

    /// Whether `buffer` has a fetch in flight.
    pub fn in_flight(&self, buffer: usize) -> bool {
        self.pending
            .lock()
            .map(|p| p.contains_key(&buffer))
            .unwrap_or(false)
    }

    /// Wait for `buffer`'s job. `None` means nothing was submitted for it.
    pub fn take(&self, buffer: usize) -> Option<Result<T>> {
        let rx = {
            let mut pending = self.pending.lock().ok()?;
            pending.remove(&buffer)?
        };
        match rx.recv() {
            Ok(result) => Some(result),
            Err(_) => Some(Err(StageError::Invariant(
                "fetch worker dropped its result channel".to_string(),
            ))),
        }
    }
}
