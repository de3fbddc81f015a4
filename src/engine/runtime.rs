//! Bounded execution runtime for identify requests.
//!
//! `IdentityEngine` is synchronous and may sleep between conflict retries.
//! This module runs it on a small pool of worker threads fed by a bounded
//! queue, so callers get backpressure (`QueueFull`) instead of unbounded
//! thread growth, and can bound their own wait with `join_timeout`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::engine::IdentityEngine;
use crate::error::{ExecutionError, LinkError, LinkResult, ValidationError};
use crate::identity::{IdentifyRequest, IdentityQuery, IdentityView};

const POOL_NAME: &str = "identify";

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct IdentityRuntimeConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum queued requests.
    pub queue_capacity: usize,
}

impl Default for IdentityRuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

impl IdentityRuntimeConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` if either value is zero.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.workers == 0 || self.queue_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "workers and queue_capacity must be positive (got {} and {})",
                    self.workers, self.queue_capacity
                ),
            });
        }
        Ok(self)
    }
}

enum Job {
    Identify {
        query: IdentityQuery,
        reply: Sender<LinkResult<IdentityView>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(workers: usize, queue_capacity: usize, engine: &Arc<IdentityEngine>) -> Self {
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let engine = Arc::clone(engine);
            let handle = thread::Builder::new()
                .name(format!("contactlink-{POOL_NAME}-{idx}"))
                .spawn(move || loop {
                    match rx.recv() {
                        Ok(Job::Identify { query, reply }) => {
                            let result = engine.identify_query(&query);
                            // The caller may have given up; the unit of work
                            // has already committed or rolled back.
                            let _ = reply.send(result);
                        }
                        Err(_) => break,

                        #[cfg(test)]
                        Ok(Job::Sleep { duration, reply }) => {
                            thread::sleep(duration);
                            let _ = reply.send(());
                        }
                    }
                })
                .expect("failed to spawn contactlink worker");
            handles.push(handle);
        }

        Self {
            tx,
            workers: handles,
            queue_capacity,
        }
    }

    fn try_submit(&self, job: Job) -> Result<(), LinkError> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(LinkError::Execution(ExecutionError::QueueFull {
                path: POOL_NAME.to_string(),
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(LinkError::Execution(ExecutionError::Disconnected {
                path: POOL_NAME.to_string(),
            })),
        }
    }

    fn shutdown(self) {
        // Close the channel: workers will drain queued jobs then exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

/// Handle returned by [`IdentityRuntime::identify_async`].
#[derive(Debug)]
pub struct ExecutionHandle {
    rx: Receiver<LinkResult<IdentityView>>,
}

impl ExecutionHandle {
    /// Waits for the request to complete.
    ///
    /// # Errors
    /// The request's own error, or `Disconnected` if the worker went away.
    pub fn join(self) -> LinkResult<IdentityView> {
        self.rx.recv().map_err(|_| {
            LinkError::Execution(ExecutionError::Disconnected {
                path: POOL_NAME.to_string(),
            })
        })?
    }

    /// Waits for the request to complete with a timeout.
    ///
    /// Timing out abandons the wait only; the request still runs to commit
    /// or rollback on its worker.
    ///
    /// # Errors
    /// The request's own error, `Timeout`, or `Disconnected`.
    pub fn join_timeout(self, timeout: Duration) -> LinkResult<IdentityView> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            crossbeam_channel::RecvTimeoutError::Timeout => LinkError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            crossbeam_channel::RecvTimeoutError::Disconnected => {
                LinkError::Execution(ExecutionError::Disconnected {
                    path: POOL_NAME.to_string(),
                })
            }
        })?
    }
}

/// Worker-pool runtime around an [`IdentityEngine`].
pub struct IdentityRuntime {
    engine: Arc<IdentityEngine>,
    pool: WorkerPool,
}

impl IdentityRuntime {
    /// Start the worker pool.
    ///
    /// # Errors
    /// Returns a validation error if `config` is invalid.
    pub fn new(engine: IdentityEngine, config: IdentityRuntimeConfig) -> LinkResult<Self> {
        let config = config.validate()?;
        let engine = Arc::new(engine);
        let pool = WorkerPool::start(config.workers, config.queue_capacity, &engine);
        Ok(Self { engine, pool })
    }

    /// Validates `request` and queues it.
    ///
    /// Validation happens on the caller's thread, so malformed requests never
    /// occupy a queue slot.
    ///
    /// # Errors
    /// `InvalidRequest` errors, or `QueueFull` / `Disconnected`.
    pub fn identify_async(&self, request: &IdentifyRequest) -> LinkResult<ExecutionHandle> {
        let query = request.validate()?;
        let (tx, rx) = bounded::<LinkResult<IdentityView>>(1);
        self.pool.try_submit(Job::Identify { query, reply: tx })?;
        Ok(ExecutionHandle { rx })
    }

    /// Validates, queues and waits for `request`.
    ///
    /// # Errors
    /// See [`IdentityRuntime::identify_async`] and [`ExecutionHandle::join`].
    pub fn identify(&self, request: &IdentifyRequest) -> LinkResult<IdentityView> {
        self.identify_async(request)?.join()
    }

    /// Returns a shared reference to the underlying engine.
    #[must_use]
    pub fn engine(&self) -> &IdentityEngine {
        &self.engine
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> Result<Receiver<()>, LinkError> {
        let (tx, rx) = bounded::<()>(1);
        self.pool.try_submit(Job::Sleep { duration, reply: tx })?;
        Ok(rx)
    }
}

impl Drop for IdentityRuntime {
    fn drop(&mut self) {
        // Deterministic shutdown: stop workers and join threads.
        let pool = std::mem::replace(
            &mut self.pool,
            WorkerPool {
                tx: bounded::<Job>(1).0,
                workers: Vec::new(),
                queue_capacity: 1,
            },
        );
        pool.shutdown();
    }
}
