// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded worker pool for oneway invocations.
//!
//! Each `Client` and each `ServerInvoker` owns its own pool so one slow
//! handler cannot hold up other sessions. Jobs queue on a bounded crossbeam
//! channel; `submit` blocks while the queue is full.

use crate::error::{Error, Result};
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads.
pub struct WorkerPool {
    name: String,
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `threads` workers sharing a queue of `queue_size` jobs.
    pub fn new(name: &str, threads: usize, queue_size: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = channel::bounded::<Job>(queue_size.max(1));
        let mut workers = Vec::with_capacity(threads);

        for i in 0..threads {
            let rx = rx.clone();
            let pool_name = name.to_string();
            let handle = thread::Builder::new()
                .name(format!("remoting-{}-{}", name, i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            log::error!("[worker-pool] job on {} panicked", pool_name);
                        }
                    }
                })
                .map_err(Error::Io)?;
            workers.push(handle);
        }

        log::debug!(
            "[worker-pool] {} started ({} threads, queue {})",
            name,
            threads,
            queue_size
        );
        Ok(Self {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job, blocking while the queue is full.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("worker pool {} is shut down", self.name)))?;
        tx.send(Box::new(job))
            .map_err(|_| Error::InvalidState(format!("worker pool {} is shut down", self.name)))
    }

    /// Stop accepting jobs; queued jobs still run.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
    }

    /// Shut down and wait for the workers to drain the queue.
    pub fn shutdown_and_wait(&self) {
        self.shutdown();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let me = thread::current().id();
        for handle in workers {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
