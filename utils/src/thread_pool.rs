// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A bounded thread pool for background jobs (blob downloads, uploads,
//! async cache writes). Submission blocks once the queue cap is reached;
//! stop drains the queue before joining the workers.

use std::collections::VecDeque;
use std::io::Result;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    stopping: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    // Wakes workers on new tasks or stop.
    worker_cv: Condvar,
    // Wakes submitters when a queue slot frees up.
    submit_cv: Condvar,
    max_tasks: usize,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    name: String,
}

impl ThreadPool {
    pub fn new(thread_num: u32, max_tasks: usize, name: &str) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                stopping: false,
            }),
            worker_cv: Condvar::new(),
            submit_cv: Condvar::new(),
            max_tasks,
        });

        let mut workers = Vec::with_capacity(thread_num as usize);
        for i in 0..thread_num {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}_{}", name, i))
                .spawn(move || Self::work_loop(shared))?;
            workers.push(handle);
        }

        Ok(ThreadPool {
            shared,
            workers: Mutex::new(workers),
            name: name.to_string(),
        })
    }

    fn work_loop(shared: Arc<PoolShared>) {
        let mut state = shared.state.lock().unwrap();
        loop {
            while state.tasks.is_empty() && !state.stopping {
                state = shared.worker_cv.wait(state).unwrap();
            }
            match state.tasks.pop_front() {
                Some(task) => {
                    shared.submit_cv.notify_one();
                    drop(state);
                    task();
                    state = shared.state.lock().unwrap();
                }
                None => break,
            }
        }
    }

    pub fn submit<F: FnOnce() + Send + 'static>(&self, task: F) {
        let mut state = self.shared.state.lock().unwrap();
        while state.tasks.len() >= self.shared.max_tasks && !state.stopping {
            state = self.shared.submit_cv.wait(state).unwrap();
        }
        if state.stopping {
            warn!("thread pool {} is stopping, task dropped", self.name);
            return;
        }
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.shared.worker_cv.notify_one();
    }

    /// Signal stop and join every worker. Queued tasks finish first.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stopping = true;
        }
        self.shared.worker_cv.notify_all();
        self.shared.submit_cv.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}
