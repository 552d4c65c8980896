use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::ProducerError;

/// A bounded pool of byte buffers shared by all producer threads.
///
/// Buffers of exactly `poolable_size` are recycled through a free list;
/// other sizes draw down a shared memory budget and return to it on
/// deallocation. When the budget is exhausted, `allocate` parks the caller
/// in a FIFO of waiters, each woken in turn as memory frees up.
#[derive(Debug)]
pub struct BufferPool {
    total_memory: usize,
    poolable_size: usize,
    inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    free: VecDeque<Vec<u8>>,
    /// Unpooled bytes available for allocation.
    available_memory: usize,
    waiters: VecDeque<Arc<Condvar>>,
}

impl BufferPool {
    pub fn new(total_memory: usize, poolable_size: usize) -> Self {
        Self {
            total_memory,
            poolable_size,
            inner: Mutex::new(PoolInner {
                free: VecDeque::new(),
                available_memory: total_memory,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    pub fn poolable_size(&self) -> usize {
        self.poolable_size
    }

    /// Memory not currently handed out: the unpooled budget plus the free
    /// list.
    pub fn available_memory(&self) -> usize {
        let inner = self.lock_inner();
        inner.available_memory + inner.free.len() * self.poolable_size
    }

    /// Number of threads blocked waiting for memory.
    pub fn queued(&self) -> usize {
        self.lock_inner().waiters.len()
    }

    /// Allocate a buffer of `size` bytes, waiting up to `max_block_ms` for
    /// memory to free up.
    pub fn allocate(&self, size: usize, max_block_ms: u64) -> Result<Vec<u8>, ProducerError> {
        if size > self.total_memory {
            return Err(ProducerError::RecordTooLarge {
                record_bytes: size,
                limit: self.total_memory,
            });
        }

        let mut inner = self.lock_inner();

        // Exact-size requests are served straight off the free list.
        if size == self.poolable_size {
            if let Some(buffer) = inner.free.pop_front() {
                return Ok(buffer);
            }
        }

        let free_list_bytes = inner.free.len() * self.poolable_size;
        if inner.available_memory + free_list_bytes >= size {
            free_up(&mut inner, size, self.poolable_size);
            inner.available_memory -= size;
            return Ok(Vec::with_capacity(size));
        }

        // Not enough now: join the waiter queue and accumulate memory as it
        // is freed, up to the deadline.
        let deadline = Instant::now() + Duration::from_millis(max_block_ms);
        let condvar = Arc::new(Condvar::new());
        inner.waiters.push_back(Arc::clone(&condvar));

        let mut accumulated = 0_usize;
        let mut buffer: Option<Vec<u8>> = None;
        let outcome = loop {
            if accumulated >= size {
                break Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(ProducerError::AllocTimeout {
                    waited_ms: max_block_ms,
                });
            }
            let (guard, _timed_out) = condvar
                .wait_timeout(inner, deadline - now)
                .expect("buffer pool lock poisoned");
            inner = guard;

            if accumulated == 0 && size == self.poolable_size {
                if let Some(recycled) = inner.free.pop_front() {
                    buffer = Some(recycled);
                    accumulated = size;
                    continue;
                }
            }
            free_up(&mut inner, size - accumulated, self.poolable_size);
            let grabbed = inner.available_memory.min(size - accumulated);
            inner.available_memory -= grabbed;
            accumulated += grabbed;
        };

        remove_waiter(&mut inner, &condvar);
        match outcome {
            Ok(()) => {
                if inner.available_memory > 0 || !inner.free.is_empty() {
                    notify_next_waiter(&inner);
                }
                Ok(buffer.unwrap_or_else(|| Vec::with_capacity(size)))
            }
            Err(err) => {
                // Give back whatever was gathered before timing out.
                inner.available_memory += accumulated;
                if inner.available_memory > 0 || !inner.free.is_empty() {
                    notify_next_waiter(&inner);
                }
                Err(err)
            }
        }
    }

    /// Return a buffer to the pool.
    pub fn deallocate(&self, mut buffer: Vec<u8>) {
        let mut inner = self.lock_inner();
        if buffer.capacity() == self.poolable_size {
            buffer.clear();
            inner.free.push_back(buffer);
        } else {
            inner.available_memory += buffer.capacity();
        }
        notify_next_waiter(&inner);
    }

    fn lock_inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("buffer pool lock poisoned")
    }
}

/// Break pooled buffers back into loose memory until `needed` bytes are
/// available (or the free list runs dry).
fn free_up(inner: &mut PoolInner, needed: usize, poolable_size: usize) {
    while inner.available_memory < needed && !inner.free.is_empty() {
        inner.free.pop_back();
        inner.available_memory += poolable_size;
    }
}

fn remove_waiter(inner: &mut PoolInner, condvar: &Arc<Condvar>) {
    if let Some(at) = inner
        .waiters
        .iter()
        .position(|waiter| Arc::ptr_eq(waiter, condvar))
    {
        inner.waiters.remove(at);
    }
}

fn notify_next_waiter(inner: &PoolInner) {
    if let Some(next) = inner.waiters.front() {
        next.notify_one();
    }
}
