// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

use crate::service::BufferPoolConfig;

/// Read buffers shared by every connection of a process.
///
/// Acquire and release never take a lock. A buffer whose bytes were split off
/// and frozen still keeps its remaining capacity and goes back to the pool; when
/// the pool is full, released buffers are simply dropped.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<BytesMut>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(config: &BufferPoolConfig) -> Self {
        BufferPool {
            buffers: ArrayQueue::new(config.max_pooled.max(1)),
            buffer_size: config.buffer_size,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn acquire(&self) -> BytesMut {
        match self.buffers.pop() {
            Some(mut buffer) => {
                buffer.clear();
                if buffer.capacity() < self.buffer_size {
                    buffer.reserve(self.buffer_size);
                }
                buffer
            }
            None => BytesMut::with_capacity(self.buffer_size),
        }
    }

    pub fn release(&self, buffer: BytesMut) {
        // buffers that shrank to almost nothing are not worth keeping
        if buffer.capacity() >= self.buffer_size / 4 {
            let _ = self.buffers.push(buffer);
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_pooled: usize) -> BufferPool {
        BufferPool::new(&BufferPoolConfig {
            buffer_size: 1024,
            max_pooled,
        })
    }

    #[test]
    fn test_acquire_release_reuses() {
        let pool = pool(2);
        let mut buffer = pool.acquire();
        assert!(buffer.capacity() >= 1024);
        buffer.extend_from_slice(b"hello");
        pool.release(buffer);
        assert_eq!(pool.pooled(), 1);
        let buffer = pool.acquire();
        assert!(buffer.is_empty());
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_full_pool_drops_buffers() {
        let pool = pool(1);
        pool.release(BytesMut::with_capacity(1024));
        pool.release(BytesMut::with_capacity(1024));
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_concurrent_use() {
        let pool = std::sync::Arc::new(pool(8));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buffer = pool.acquire();
                        pool.release(buffer);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.pooled() <= 8);
    }
}
