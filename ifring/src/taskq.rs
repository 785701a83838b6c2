//! # Deferred Work Units
//!
//! ## Purpose
//!
//! Interrupts never process packets inline. They enqueue a `GroupTask`, and a
//! tokio task owned by that unit runs the bottom half. Enqueueing an already
//! pending unit coalesces with the pending run, so an interrupt storm costs one
//! run, not one run per interrupt.
//!
//! ## How it works
//!
//! Each unit has a `Notify` and a `pending` flag. `enqueue` sets the flag and
//! stores a notify permit only on the idle-to-pending edge. The runner clears
//! the flag before calling the body, so an enqueue that races with a running
//! body schedules exactly one more run. Bodies are synchronous and bounded by
//! their own budgets; the runner yields after each run so units sharing a
//! worker stay fair. Runners stop when their cancellation token fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct GroupTask {
    name: String,
    notify: Notify,
    pending: AtomicBool,
    enqueued: AtomicU64,
    runs: AtomicU64,
}

impl GroupTask {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(GroupTask {
            name: name.into(),
            notify: Notify::new(),
            pending: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            runs: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedules one run of the body.
    pub fn enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    /// A run is scheduled and has not started yet.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Spawns the runner that executes `body` once per scheduled run.
    pub fn attach<F>(
        self: &Arc<Self>,
        handle: &Handle,
        tracker: &TaskTracker,
        cancel: CancellationToken,
        body: F,
    ) where
        F: Fn() + Send + Sync + 'static,
    {
        let task = self.clone();
        tracker.spawn_on(
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = task.notify.notified() => {}
                    }
                    task.pending.store(false, Ordering::Release);
                    body();
                    task.runs.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
                log::trace!("task {} stopped", task.name);
            },
            handle,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn coalesces_pending_runs() {
        let task = GroupTask::new("t");
        let hits = Arc::new(AtomicUsize::new(0));
        task.enqueue();
        task.enqueue();
        task.enqueue();
        assert!(task.is_pending());

        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let h = hits.clone();
        task.attach(&Handle::current(), &tracker, cancel.clone(), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(task.enqueued(), 3);

        task.enqueue();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(!task.is_pending());
    }
}
