use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::buffered_task::{BatchRunner, BufferedTask};

const PROBE_PERIOD: Duration = Duration::from_secs(60);

/// A work queue whose backlog can be dropped and later re-derived from
/// the store.
pub trait ShedQueue: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn backlog_bytes(&self) -> usize;
    /// Drop half the backlog; returns entries dropped.
    fn shed_half(&self) -> usize;
}

impl<R: BatchRunner> ShedQueue for BufferedTask<R> {
    fn name(&self) -> &'static str {
        R::NAME
    }

    fn backlog_bytes(&self) -> usize {
        BufferedTask::backlog_bytes(self)
    }

    fn shed_half(&self) -> usize {
        BufferedTask::shed_half(self)
    }
}

/// Samples the aggregate queue backlog once per minute. Over the soft
/// limit, every shrinkable queue drops half its backlog; the shed work is
/// reconstituted by the queues' next init scan.
pub struct MemoryMonitor {
    limit_bytes: usize,
    queues: Vec<Arc<dyn ShedQueue>>,
}

impl MemoryMonitor {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit_bytes,
            queues: Vec::new(),
        }
    }

    pub fn register(&mut self, queue: Arc<dyn ShedQueue>) {
        self.queues.push(queue);
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PROBE_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                self.probe();
            }
        })
    }

    /// One sampling pass; returns the number of entries shed.
    pub fn probe(&self) -> usize {
        let total: usize = self.queues.iter().map(|q| q.backlog_bytes()).sum();
        if total <= self.limit_bytes {
            return 0;
        }

        tracing::warn!(
            "work queue backlog {} bytes over the {} byte soft limit, shedding",
            total,
            self.limit_bytes
        );

        let mut dropped = 0;
        for queue in &self.queues {
            let shed = queue.shed_half();
            if shed > 0 {
                tracing::warn!("{}: dropped {} backlog entries", queue.name(), shed);
            }
            dropped += shed;
        }

        if dropped == 0 {
            tracing::error!(
                "memory soft limit exceeded but every queue is already minimal"
            );
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeQueue {
        entries: AtomicUsize,
    }

    impl ShedQueue for FakeQueue {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn backlog_bytes(&self) -> usize {
            self.entries.load(Ordering::SeqCst) * 1024
        }

        fn shed_half(&self) -> usize {
            let before = self.entries.load(Ordering::SeqCst);
            let dropped = before / 2;
            self.entries.store(before - dropped, Ordering::SeqCst);
            dropped
        }
    }

    #[test]
    fn probe_halves_every_queue_over_the_limit() {
        // ten queues of 10 KiB against a 64 KiB limit
        let mut monitor = MemoryMonitor::new(64 * 1024);
        let queues: Vec<Arc<FakeQueue>> = (0..10)
            .map(|_| Arc::new(FakeQueue { entries: AtomicUsize::new(10) }))
            .collect();
        for queue in &queues {
            monitor.register(Arc::clone(queue) as Arc<dyn ShedQueue>);
        }

        let dropped = monitor.probe();
        assert_eq!(dropped, 50);
        for queue in &queues {
            assert_eq!(queue.entries.load(Ordering::SeqCst), 5);
        }
    }

    #[test]
    fn probe_is_a_no_op_under_the_limit() {
        let mut monitor = MemoryMonitor::new(1024 * 1024);
        let queue = Arc::new(FakeQueue { entries: AtomicUsize::new(10) });
        monitor.register(Arc::clone(&queue) as Arc<dyn ShedQueue>);
        assert_eq!(monitor.probe(), 0);
        assert_eq!(queue.entries.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn probe_reports_nothing_to_shed_when_queues_are_empty() {
        let mut monitor = MemoryMonitor::new(0);
        let queue = Arc::new(FakeQueue { entries: AtomicUsize::new(1) });
        monitor.register(Arc::clone(&queue) as Arc<dyn ShedQueue>);
        // 1 entry over a zero limit: half of one rounds down to zero dropped
        assert_eq!(monitor.probe(), 0);
    }
}
