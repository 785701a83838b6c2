//! Heap buffer pool with recycling, an outstanding-buffer limit and
//! allocation fault injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ifring::{Buffer, BufferPool, Recycle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub outstanding: usize,
    pub allocs: u64,
    pub reused: u64,
    pub failures: u64,
}

struct Cache {
    limit: usize,
    outstanding: AtomicUsize,
    allocs: AtomicU64,
    reused: AtomicU64,
    failures: AtomicU64,
    /// Fail every n-th allocation; 0 disables.
    fault_every: AtomicU64,
    calls: AtomicU64,
    /// Returned buffers by size.
    free: Mutex<HashMap<usize, Vec<Box<[u8]>>>>,
}

impl Recycle for Cache {
    fn recycle(&self, data: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.entry(data.len()).or_default().push(data);
    }
}

pub struct HeapPool {
    cache: Arc<Cache>,
    max_buf_size: usize,
}

impl HeapPool {
    /// A pool handing out at most `limit` buffers of up to `max_buf_size`
    /// bytes at a time.
    pub fn new(limit: usize, max_buf_size: usize) -> Self {
        HeapPool {
            cache: Arc::new(Cache {
                limit,
                outstanding: AtomicUsize::new(0),
                allocs: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                fault_every: AtomicU64::new(0),
                calls: AtomicU64::new(0),
                free: Mutex::new(HashMap::new()),
            }),
            max_buf_size,
        }
    }

    /// Makes every `n`-th allocation fail; 0 turns faults off.
    pub fn inject_faults(&self, n: u64) {
        self.cache.fault_every.store(n, Ordering::Relaxed);
    }

    pub fn outstanding(&self) -> usize {
        self.cache.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.cache;
        PoolStats {
            outstanding: self.outstanding(),
            allocs: c.allocs.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }
}

impl BufferPool for HeapPool {
    fn alloc(&self, size: usize) -> Option<Buffer> {
        let c = &self.cache;
        let n = c.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let every = c.fault_every.load(Ordering::Relaxed);
        if size > self.max_buf_size
            || (every != 0 && n % every == 0)
            || c.outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| (cur < c.limit).then_some(cur + 1))
                .is_err()
        {
            c.failures.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        c.allocs.fetch_add(1, Ordering::Relaxed);
        let cached = c
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&size)
            .and_then(Vec::pop);
        let data = match cached {
            Some(mut data) => {
                c.reused.fetch_add(1, Ordering::Relaxed);
                data.fill(0);
                data
            }
            None => vec![0; size].into_boxed_slice(),
        };
        Some(Buffer::pooled(data, self.cache.clone()))
    }

    fn max_buf_size(&self) -> usize {
        self.max_buf_size
    }
}
