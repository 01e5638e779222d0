// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The pipelined read-ahead engine: a ring of prefetch pipes filled by
//! worker threads at strided offsets so a linear reader draining pipe 0, 1,
//! 2, 0, … observes bytes in file order.

use std::cmp::min;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::buffer::mem_pool::{MemPool, PoolBlock};
use crate::PIPE_COUNT;

/// Fills `buf` with file content at `offset`; returns bytes read or a
/// negative errno.
pub type PipeReader = Arc<dyn Fn(&mut [u8], u64) -> isize + Send + Sync>;

struct PipeState {
    mem: Option<PoolBlock>,
    capacity: usize,
    // Valid byte count after the last fill; negative propagates a producer
    // error to the consumer.
    size: i64,
    index: i64,
    stop: bool,
}

pub struct Pipe {
    state: Mutex<PipeState>,
    read_cv: Condvar,
    write_cv: Condvar,
}

impl Default for Pipe {
    fn default() -> Self {
        Pipe {
            state: Mutex::new(PipeState {
                mem: None,
                capacity: 0,
                size: 0,
                index: 0,
                stop: true,
            }),
            read_cv: Condvar::new(),
            write_cv: Condvar::new(),
        }
    }
}

impl Pipe {
    fn init(&self, capacity: usize, mem: PoolBlock) {
        let mut state = self.state.lock().unwrap();
        state.mem = Some(mem);
        state.capacity = capacity;
        // Start in the fully-consumed state so the producer fills first.
        state.size = capacity as i64;
        state.index = capacity as i64;
        state.stop = false;
    }

    fn destroy(state: &mut PipeState) {
        state.capacity = 0;
        state.size = 0;
        state.index = 0;
        state.stop = true;
        state.mem = None;
    }

    /// Pop up to `buf.len()` bytes. Returns `(bytes, end_of_pipe)`; zero
    /// bytes means the stream ended, negative propagates a producer error.
    pub fn wait_pop(&self, buf: &mut [u8]) -> (isize, bool) {
        let mut state = self.state.lock().unwrap();
        while state.index == state.size && state.size > 0 && !state.stop {
            state = self.read_cv.wait(state).unwrap();
        }

        if state.size < 0 {
            let err = state.size as isize;
            error!("Pipe::wait_pop(): read error: {}", -err);
            Self::destroy(&mut state);
            return (err, false);
        }
        if state.size == 0 {
            Self::destroy(&mut state);
            return (0, false);
        }
        if state.index == state.size && state.stop {
            Self::destroy(&mut state);
            return (0, false);
        }

        let available = (state.size - state.index) as usize;
        let count = min(buf.len(), available);
        let index = state.index as usize;
        let mem = state.mem.as_ref().unwrap();
        buf[..count].copy_from_slice(&mem[index..index + count]);
        state.index += count as i64;

        let mut end = false;
        if state.index == state.size {
            if state.stop {
                Self::destroy(&mut state);
            }
            end = true;
            self.write_cv.notify_all();
        }
        (count as isize, end)
    }

    /// Wait for the pipe to drain, then refill it through `reader`.
    fn wait_push(&self, reader: &PipeReader, offset: u64) -> isize {
        let mut state = self.state.lock().unwrap();
        while state.index != state.size && !state.stop {
            state = self.write_cv.wait(state).unwrap();
        }
        if state.stop {
            self.read_cv.notify_all();
            return 0;
        }

        let capacity = state.capacity;
        let mem = state.mem.as_mut().unwrap();
        let read_size = reader(&mut mem[..capacity], offset);
        if read_size < 0 {
            error!("Pipe::wait_push(): producer failed at offset {}", offset);
        }

        state.index = 0;
        state.size = read_size as i64;
        self.read_cv.notify_all();
        read_size
    }

    fn mark_stopped(&self) {
        let mut state = self.state.lock().unwrap();
        state.stop = true;
        self.read_cv.notify_all();
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        Self::destroy(&mut state);
        self.write_cv.notify_all();
        self.read_cv.notify_all();
    }
}

struct StreamState {
    pipe_num: usize,
    pipe_cap: usize,
    pipe_index: usize,
    threads: Vec<JoinHandle<()>>,
}

pub struct ReadStream {
    pipes: Vec<Arc<Pipe>>,
    inner: Mutex<StreamState>,
    stop_flag: Arc<AtomicBool>,
    // Offset of the first short fill; workers past it exit.
    stop_offset: Arc<AtomicU64>,
}

impl Default for ReadStream {
    fn default() -> Self {
        ReadStream {
            pipes: (0..PIPE_COUNT).map(|_| Arc::new(Pipe::default())).collect(),
            inner: Mutex::new(StreamState {
                pipe_num: 0,
                pipe_cap: 0,
                pipe_index: 0,
                threads: Vec::new(),
            }),
            stop_flag: Arc::new(AtomicBool::new(true)),
            stop_offset: Arc::new(AtomicU64::new(u64::MAX)),
        }
    }
}

impl ReadStream {
    /// Allocate `min(blocks, PIPE_COUNT)` pipe buffers from the pool.
    pub fn init(&self, pool: &Arc<MemPool>, blocks: usize, pipe_size: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let pipe_num = min(blocks.max(1), PIPE_COUNT);
        let mem = pool.alloc_bulk(pipe_num);
        if mem.is_empty() {
            error!("ReadStream::init(): pipe buffer allocation failed");
            return false;
        }
        for (pipe, block) in self.pipes.iter().zip(mem) {
            pipe.init(pipe_size, block);
        }
        inner.pipe_num = pipe_num;
        inner.pipe_cap = pipe_size;
        inner.pipe_index = 0;
        self.stop_flag.store(false, Ordering::SeqCst);
        self.stop_offset.store(u64::MAX, Ordering::SeqCst);
        true
    }

    /// Spawn one producer per pipe. Worker `k` fills at
    /// `k*cap, (k+N)*cap, (k+2N)*cap, …` until a short fill publishes the
    /// cutoff offset.
    pub fn start(&self, reader: PipeReader) {
        let mut inner = self.inner.lock().unwrap();
        let pipe_num = inner.pipe_num;
        let pipe_cap = inner.pipe_cap;
        for i in 0..pipe_num {
            let pipe = self.pipes[i].clone();
            let reader = reader.clone();
            let stop_flag = self.stop_flag.clone();
            let stop_offset = self.stop_offset.clone();
            let handle = std::thread::Builder::new()
                .name(format!("falcon_pre_read_{}", i))
                .spawn(move || {
                    let mut offset = (i * pipe_cap) as u64;
                    while !stop_flag.load(Ordering::SeqCst)
                        && offset < stop_offset.load(Ordering::SeqCst)
                    {
                        let ret = pipe.wait_push(&reader, offset);
                        if ret != pipe_cap as isize {
                            // Short fill is end-of-file or error; later
                            // workers see the cutoff before touching their
                            // pipes because pipes drain in order.
                            stop_offset.store(offset, Ordering::SeqCst);
                            break;
                        }
                        offset += (pipe_num * pipe_cap) as u64;
                    }
                    pipe.mark_stopped();
                })
                .expect("spawn prefetch worker");
            inner.threads.push(handle);
        }
    }

    /// Pop `buf.len()` bytes in file order, rotating to the next pipe when
    /// the current one drains. Short return means end of stream; negative
    /// propagates the producer error.
    pub fn wait_pop(&self, buf: &mut [u8]) -> isize {
        let mut inner = self.inner.lock().unwrap();
        let mut read_size: usize = 0;
        while !self.stop_flag.load(Ordering::SeqCst) && read_size != buf.len() {
            let pipe = &self.pipes[inner.pipe_index];
            let (cur, end) = pipe.wait_pop(&mut buf[read_size..]);
            if end {
                inner.pipe_index = (inner.pipe_index + 1) % inner.pipe_num;
            }
            if cur < 0 {
                return cur;
            }
            if cur == 0 {
                break;
            }
            read_size += cur as usize;
        }
        read_size as isize
    }

    /// Stop all producers and release every pipe buffer. Permanent for this
    /// stream instance.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        for pipe in &self.pipes {
            pipe.stop();
        }
    }

    pub fn wait_ended(&self) {
        let threads = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.threads)
        };
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.stop();
        self.wait_ended();
    }
}
