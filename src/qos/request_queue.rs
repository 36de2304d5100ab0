use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{DnsError, Result};

pub type RequestFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A queued unit of work. Lower `priority` is served first.
pub struct QueuedRequest {
    pub execute: Option<Box<dyn FnOnce() -> RequestFuture + Send>>,
    pub priority: i32,
    pub enqueued_at: Instant,
}

impl QueuedRequest {
    pub fn new<F, Fut>(priority: i32, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            execute: Some(Box::new(move || Box::pin(f()))),
            priority,
            enqueued_at: Instant::now(),
        }
    }
}

struct HeapEntry(QueuedRequest);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap; reverse for lowest-priority-first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.priority.cmp(&self.0.priority)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_wait_time: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_wait_time: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_size == 0 {
            self.max_size = defaults.max_size;
        }
        if self.max_wait_time.is_zero() {
            self.max_wait_time = defaults.max_wait_time;
        }
        self
    }
}

/// Bounded priority queue with admission control and wait-time expiry.
pub struct RequestQueue {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    max_size: usize,
    max_wait_time: Duration,

    dropped: AtomicU64,
    processed: AtomicU64,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        let config = config.sanitized();
        Self {
            heap: Mutex::new(BinaryHeap::with_capacity(config.max_size)),
            max_size: config.max_size,
            max_wait_time: config.max_wait_time,
            dropped: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    /// Admit a request, or reject with [`DnsError::QueueFull`] at capacity.
    pub fn enqueue(&self, req: QueuedRequest) -> Result<()> {
        let mut heap = self.heap.lock();
        if heap.len() >= self.max_size {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(DnsError::QueueFull);
        }
        heap.push(HeapEntry(req));
        Ok(())
    }

    /// Remove and return the highest-priority request still within its wait
    /// budget. Expired entries are discarded along the way. `None` means the
    /// queue is empty or everything left had expired.
    pub fn dequeue(&self) -> Option<QueuedRequest> {
        let mut heap = self.heap.lock();
        let now = Instant::now();

        while let Some(entry) = heap.pop() {
            if now.duration_since(entry.0.enqueued_at) > self.max_wait_time {
                continue;
            }
            return Some(entry.0);
        }

        None
    }

    /// Dequeue one request and run it.
    pub async fn process(&self) -> Result<()> {
        let Some(mut req) = self.dequeue() else {
            return Ok(());
        };

        let Some(execute) = req.execute.take() else {
            return Ok(());
        };

        let result = execute().await;
        match result {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.heap.lock().clear();
    }
}
