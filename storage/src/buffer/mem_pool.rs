// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A slab of fixed-size, 512-aligned buffers reused by the prefetch pipes
//! and the write assembler's serial fragments. Freed blocks go back on the
//! free list up to the configured capacity; the rest are released.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

const ALIGNMENT: usize = 512;

/// A heap buffer aligned for direct I/O.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    pub fn new(len: usize) -> Option<Self> {
        let layout = Layout::from_size_align(len.max(ALIGNMENT), ALIGNMENT).ok()?;
        // Zeroing is skipped; every consumer tracks its own valid length.
        let raw = unsafe { alloc(layout) };
        NonNull::new(raw).map(|ptr| AlignedBuf { ptr, len })
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len.max(ALIGNMENT), ALIGNMENT).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

pub struct MemPool {
    block_size: usize,
    capacity: usize,
    free: Mutex<VecDeque<AlignedBuf>>,
}

impl MemPool {
    pub fn new(block_size: usize, capacity: usize) -> Arc<Self> {
        Arc::new(MemPool {
            block_size,
            capacity,
            free: Mutex::new(VecDeque::new()),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn alloc_block(self: &Arc<Self>) -> Option<PoolBlock> {
        let recycled = self.free.lock().unwrap().pop_front();
        let buf = match recycled {
            Some(buf) => buf,
            None => AlignedBuf::new(self.block_size)?,
        };
        Some(PoolBlock {
            buf: Some(buf),
            pool: self.clone(),
        })
    }

    /// All-or-nothing bulk allocation for the pipe ring.
    pub fn alloc_bulk(self: &Arc<Self>, count: usize) -> Vec<PoolBlock> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            match self.alloc_block() {
                Some(block) => blocks.push(block),
                None => {
                    blocks.clear();
                    return blocks;
                }
            }
        }
        blocks
    }

    fn recycle(&self, buf: AlignedBuf) {
        let mut free = self.free.lock().unwrap();
        if free.len() < self.capacity {
            free.push_back(buf);
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// A pool-owned block; returns its memory to the pool on drop.
pub struct PoolBlock {
    buf: Option<AlignedBuf>,
    pool: Arc<MemPool>,
}

impl Deref for PoolBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().unwrap()
    }
}

impl DerefMut for PoolBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(buf);
        }
    }
}
