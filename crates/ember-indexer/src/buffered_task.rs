use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct BufferedTaskOptions {
    /// Period at which buffered entries are re-batched onto the run queue.
    pub flush_interval: Duration,
    /// Largest batch handed to `run`.
    pub max_batch_size: usize,
    /// Concurrent in-flight batches.
    pub max_concurrency: usize,
    /// Page size for the initial store scan.
    pub init_chunk_size: usize,
}

impl Default for BufferedTaskOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3),
            max_batch_size: 100,
            max_concurrency: 4,
            init_chunk_size: 1000,
        }
    }
}

/// What a batch run asks the queue to do next.
pub enum RunOutcome<E> {
    Ok,
    /// Re-run later with these (possibly reduced) entries.
    Retry { entries: Vec<E>, reason: String },
    /// Give up on the batch entirely.
    Halt { reason: String },
}

/// Work callback for a [`BufferedTask`].
///
/// `init` is polled once at boot to reconstitute unfinished work from the
/// store; `run` processes one batch and reports the outcome. A panicking
/// `run` is treated as a retry of the same entries.
#[async_trait]
pub trait BatchRunner: Send + Sync + 'static {
    type Entry: Clone + Send + Sync + std::fmt::Debug + 'static;

    /// Queue name used in logs and by the memory monitor.
    const NAME: &'static str;

    /// Stream of entry chunks scanned from the store, paged at `chunk_size`.
    fn init(&self, chunk_size: usize) -> BoxStream<'_, Result<Vec<Self::Entry>, sqlx::Error>>;

    async fn run(&self, batch: Vec<Self::Entry>, retries: u32) -> RunOutcome<Self::Entry>;

    /// Rough in-memory weight of one entry, for backlog accounting.
    fn entry_weight(&self) -> usize {
        std::mem::size_of::<Self::Entry>().max(16)
    }
}

struct Batch<E> {
    entries: Vec<E>,
    retries: u32,
}

struct State<E> {
    /// Buffered entries awaiting the next flush.
    pending: VecDeque<E>,
    /// Batches ready to run (including retries).
    batches: VecDeque<Batch<E>>,
}

/// Generic batching work queue: external producers `buffer` entries at any
/// time, a supervisor re-batches them every `flush_interval`, and up to
/// `max_concurrency` workers run batches through the [`BatchRunner`].
/// Retries have no upper bound; a runner that wants to give up answers
/// `Halt`. Batch order is not preserved.
pub struct BufferedTask<R: BatchRunner> {
    runner: Arc<R>,
    options: BufferedTaskOptions,
    state: Arc<Mutex<State<R::Entry>>>,
    notify: Arc<Notify>,
    slots: Arc<Semaphore>,
}

impl<R: BatchRunner> Clone for BufferedTask<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            options: self.options.clone(),
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<R: BatchRunner> BufferedTask<R> {
    pub fn new(runner: R, options: BufferedTaskOptions) -> Self {
        let slots = Arc::new(Semaphore::new(options.max_concurrency));
        Self {
            runner: Arc::new(runner),
            options,
            state: Arc::new(Mutex::new(State {
                pending: VecDeque::new(),
                batches: VecDeque::new(),
            })),
            notify: Arc::new(Notify::new()),
            slots,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Hand entries to the queue. Never blocks and is always accepted;
    /// entries are re-batched to `max_batch_size` on the next flush.
    pub fn buffer(&self, entries: Vec<R::Entry>) {
        if entries.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock().expect("buffered task state poisoned");
            state.pending.extend(entries);
        }
        self.notify.notify_one();
    }

    pub fn backlog_entries(&self) -> usize {
        let state = self.state.lock().expect("buffered task state poisoned");
        state.pending.len() + state.batches.iter().map(|b| b.entries.len()).sum::<usize>()
    }

    pub fn backlog_bytes(&self) -> usize {
        self.backlog_entries() * self.runner.entry_weight()
    }

    /// Drop roughly half the backlog, oldest batches first. The dropped
    /// work is re-derived from the store by a later `init` scan.
    pub fn shed_half(&self) -> usize {
        let mut state = self.state.lock().expect("buffered task state poisoned");
        let total =
            state.pending.len() + state.batches.iter().map(|b| b.entries.len()).sum::<usize>();
        let target = total / 2;
        let mut dropped = 0;
        while dropped < target {
            if let Some(batch) = state.batches.pop_front() {
                dropped += batch.entries.len();
            } else {
                let take = (target - dropped).min(state.pending.len());
                if take == 0 {
                    break;
                }
                state.pending.drain(..take);
                dropped += take;
            }
        }
        dropped
    }

    /// Seed from the store, then supervise flush/dispatch until aborted.
    pub fn start(&self) -> JoinHandle<()> {
        let task = self.clone();
        tokio::spawn(async move {
            task.seed_from_store().await;
            task.supervise().await;
        })
    }

    async fn seed_from_store(&self) {
        let mut seeded = 0usize;
        {
            let mut stream = self.runner.init(self.options.init_chunk_size);
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(entries) => {
                        seeded += entries.len();
                        self.buffer(entries);
                    }
                    Err(error) => {
                        // whatever was missed comes back on the next boot scan
                        tracing::warn!("{}: initial store scan aborted: {}", R::NAME, error);
                        break;
                    }
                }
            }
        }
        if seeded > 0 {
            tracing::info!("{}: seeded {} entries from store", R::NAME, seeded);
        }
    }

    async fn supervise(&self) {
        let mut flush = tokio::time::interval(self.options.flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = flush.tick() => self.flush_pending(),
                _ = self.notify.notified() => {}
            }
            self.dispatch();
        }
    }

    fn flush_pending(&self) {
        let mut state = self.state.lock().expect("buffered task state poisoned");
        while !state.pending.is_empty() {
            let take = state.pending.len().min(self.options.max_batch_size);
            let entries: Vec<R::Entry> = state.pending.drain(..take).collect();
            state.batches.push_back(Batch { entries, retries: 0 });
        }
    }

    fn dispatch(&self) {
        loop {
            let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let batch = {
                let mut state = self.state.lock().expect("buffered task state poisoned");
                state.batches.pop_front()
            };
            let Some(batch) = batch else {
                drop(permit);
                return;
            };
            let task = self.clone();
            tokio::spawn(async move {
                task.run_batch(batch).await;
                drop(permit);
                task.notify.notify_one();
            });
        }
    }

    async fn run_batch(&self, batch: Batch<R::Entry>) {
        let retries = batch.retries;
        let backup = batch.entries.clone();
        let outcome =
            AssertUnwindSafe(self.runner.run(batch.entries, retries)).catch_unwind().await;
        match outcome {
            Ok(RunOutcome::Ok) => {}
            Ok(RunOutcome::Retry { entries, reason }) => {
                tracing::warn!("{}: batch retry #{}: {}", R::NAME, retries + 1, reason);
                self.requeue(entries, retries + 1);
            }
            Ok(RunOutcome::Halt { reason }) => {
                tracing::warn!("{}: dropping batch of {}: {}", R::NAME, backup.len(), reason);
            }
            Err(_) => {
                tracing::error!(
                    "{}: batch task crashed, re-queueing {} entries",
                    R::NAME,
                    backup.len()
                );
                self.requeue(backup, retries + 1);
            }
        }
    }

    fn requeue(&self, entries: Vec<R::Entry>, retries: u32) {
        if entries.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("buffered task state poisoned");
        state.batches.push_back(Batch { entries, retries });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingRunner {
        runs: Arc<StdMutex<Vec<(Vec<u32>, u32)>>>,
        outcomes: Arc<StdMutex<VecDeque<&'static str>>>,
        seed: Vec<u32>,
    }

    impl RecordingRunner {
        fn new(outcomes: &[&'static str]) -> Self {
            Self {
                runs: Arc::new(StdMutex::new(Vec::new())),
                outcomes: Arc::new(StdMutex::new(outcomes.iter().copied().collect())),
                seed: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl BatchRunner for RecordingRunner {
        type Entry = u32;
        const NAME: &'static str = "recording";

        fn init(&self, _chunk_size: usize) -> BoxStream<'_, Result<Vec<u32>, sqlx::Error>> {
            if self.seed.is_empty() {
                futures::stream::empty().boxed()
            } else {
                futures::stream::once(async { Ok(self.seed.clone()) }).boxed()
            }
        }

        async fn run(&self, batch: Vec<u32>, retries: u32) -> RunOutcome<u32> {
            self.runs.lock().unwrap().push((batch.clone(), retries));
            let next = self.outcomes.lock().unwrap().pop_front().unwrap_or("ok");
            match next {
                "retry" => RunOutcome::Retry {
                    entries: batch,
                    reason: "test retry".into(),
                },
                "halt" => RunOutcome::Halt {
                    reason: "test halt".into(),
                },
                _ => RunOutcome::Ok,
            }
        }
    }

    fn options() -> BufferedTaskOptions {
        BufferedTaskOptions {
            flush_interval: Duration::from_millis(10),
            max_batch_size: 3,
            max_concurrency: 2,
            init_chunk_size: 10,
        }
    }

    #[tokio::test]
    async fn buffered_entries_run_in_bounded_batches() {
        let runner = RecordingRunner::new(&[]);
        let runs = Arc::clone(&runner.runs);
        let task = BufferedTask::new(runner, options());
        task.buffer(vec![1, 2, 3, 4, 5]);
        let handle = task.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        let runs = runs.lock().unwrap();
        let mut seen: Vec<u32> = runs.iter().flat_map(|(b, _)| b.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(runs.iter().all(|(b, _)| b.len() <= 3));
    }

    #[tokio::test]
    async fn retry_increments_counter_until_ok() {
        let runner = RecordingRunner::new(&["retry", "retry", "ok"]);
        let runs = Arc::clone(&runner.runs);
        let task = BufferedTask::new(runner, options());
        task.buffer(vec![9]);
        let handle = task.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        let runs = runs.lock().unwrap();
        let retries: Vec<u32> = runs.iter().map(|(_, r)| *r).collect();
        assert_eq!(retries, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn halt_drops_the_batch() {
        let runner = RecordingRunner::new(&["halt"]);
        let runs = Arc::clone(&runner.runs);
        let task = BufferedTask::new(runner, options());
        task.buffer(vec![7]);
        let handle = task.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert_eq!(runs.lock().unwrap().len(), 1);
        assert_eq!(task.backlog_entries(), 0);
    }

    #[tokio::test]
    async fn init_stream_seeds_the_queue() {
        let mut runner = RecordingRunner::new(&[]);
        runner.seed = vec![40, 41];
        let runs = Arc::clone(&runner.runs);
        let task = BufferedTask::new(runner, options());
        let handle = task.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        let runs = runs.lock().unwrap();
        let seen: Vec<u32> = runs.iter().flat_map(|(b, _)| b.clone()).collect();
        assert_eq!(seen, vec![40, 41]);
    }

    #[tokio::test]
    async fn shed_half_drops_half_the_backlog() {
        let runner = RecordingRunner::new(&[]);
        let task = BufferedTask::new(runner, options());
        task.buffer((0..10).collect());
        assert_eq!(task.backlog_entries(), 10);
        let dropped = task.shed_half();
        assert_eq!(dropped, 5);
        assert_eq!(task.backlog_entries(), 5);
    }
}
