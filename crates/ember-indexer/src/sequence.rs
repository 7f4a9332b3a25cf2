use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// An inclusive range of block numbers. `first > last` means the range is
/// walked downwards (catch-up indexes from the tip towards genesis).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub first: u64,
    pub last: u64,
}

impl BlockRange {
    pub fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    pub fn len(&self) -> u64 {
        self.first.abs_diff(self.last) + 1
    }

    pub fn is_descending(&self) -> bool {
        self.first > self.last
    }

    /// Block numbers in walk order.
    pub fn numbers(&self) -> Box<dyn Iterator<Item = u64> + Send> {
        if self.is_descending() {
            Box::new((self.last..=self.first).rev())
        } else {
            Box::new(self.first..=self.last)
        }
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.first, self.last)
    }
}

enum Mode {
    Finite,
    /// Endless ascending tail; `current` is the next block to hand out.
    Infinite { current: u64 },
}

struct Inner {
    queue: VecDeque<BlockRange>,
    mode: Mode,
    step: i64,
}

/// Shared generator of block ranges consumed by concurrent range workers.
///
/// Finite sequences are seeded with pre-chunked ranges and return `None`
/// once drained. Infinite sequences keep producing `|step|`-sized ranges
/// from a cursor until `cap()` converts them to finite. Failed ranges go
/// back in via `queue()` and come out again at the tail.
#[derive(Clone)]
pub struct Sequence {
    inner: Arc<Mutex<Inner>>,
}

impl Sequence {
    /// A finite sequence over `ranges`, each chunked to at most `|step|`
    /// blocks. `step` must be nonzero; its sign carries the walk direction
    /// of ranges produced by an infinite tail and is informational here
    /// (each seeded range keeps its own direction).
    pub fn new_finite(ranges: &[BlockRange], step: i64) -> Self {
        assert!(step != 0, "sequence step must be nonzero");
        let chunk = step.unsigned_abs();
        let queue = ranges
            .iter()
            .flat_map(|range| chunk_range(*range, chunk))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue,
                mode: Mode::Finite,
                step,
            })),
        }
    }

    /// An infinite ascending sequence starting at `first`, producing
    /// `step`-sized ranges. `step` must be positive.
    pub fn new_infinite(first: u64, step: i64) -> Self {
        assert!(step > 0, "infinite sequences only run forwards");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                mode: Mode::Infinite { current: first },
                step,
            })),
        }
    }

    /// Next range, or `None` once a finite sequence is exhausted.
    /// Concurrent callers each receive a distinct range.
    pub async fn pop(&self) -> Option<BlockRange> {
        let mut inner = self.inner.lock().await;
        if let Some(range) = inner.queue.pop_front() {
            return Some(range);
        }
        let step = inner.step;
        match &mut inner.mode {
            Mode::Finite => None,
            Mode::Infinite { current } => {
                let first = *current;
                let last = first + (step as u64 - 1);
                *current = last + 1;
                Some(BlockRange::new(first, last))
            }
        }
    }

    /// Re-insert a range at the tail, typically after a failed fetch.
    pub async fn queue(&self, range: BlockRange) {
        let mut inner = self.inner.lock().await;
        inner.queue.push_back(range);
    }

    /// Convert an infinite sequence to finite: already-queued ranges still
    /// drain, after which `pop()` returns `None`.
    pub async fn cap(&self) {
        let mut inner = self.inner.lock().await;
        inner.mode = Mode::Finite;
    }
}

/// Split `range` into chunks of at most `size` blocks, walking in the
/// range's own direction and preserving both endpoints.
fn chunk_range(range: BlockRange, size: u64) -> Vec<BlockRange> {
    assert!(size > 0);
    let mut chunks = Vec::with_capacity((range.len() / size + 1) as usize);
    if range.is_descending() {
        let mut first = range.first;
        loop {
            let last = first.saturating_sub(size - 1).max(range.last);
            chunks.push(BlockRange::new(first, last));
            if last == range.last {
                break;
            }
            first = last - 1;
        }
    } else {
        let mut first = range.first;
        loop {
            let last = (first + size - 1).min(range.last);
            chunks.push(BlockRange::new(first, last));
            if last == range.last {
                break;
            }
            first = last + 1;
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_preserves_endpoints_ascending() {
        let chunks = chunk_range(BlockRange::new(1, 10), 4);
        assert_eq!(
            chunks,
            vec![
                BlockRange::new(1, 4),
                BlockRange::new(5, 8),
                BlockRange::new(9, 10),
            ]
        );
    }

    #[test]
    fn chunking_preserves_endpoints_descending() {
        let chunks = chunk_range(BlockRange::new(10, 1), 4);
        assert_eq!(
            chunks,
            vec![
                BlockRange::new(10, 7),
                BlockRange::new(6, 3),
                BlockRange::new(2, 1),
            ]
        );
    }

    #[test]
    fn chunking_handles_range_smaller_than_chunk() {
        assert_eq!(
            chunk_range(BlockRange::new(9, 6), 10),
            vec![BlockRange::new(9, 6)]
        );
        assert_eq!(
            chunk_range(BlockRange::new(5, 5), 4),
            vec![BlockRange::new(5, 5)]
        );
    }

    #[tokio::test]
    async fn finite_sequence_drains_then_halts() {
        let seq = Sequence::new_finite(&[BlockRange::new(9, 6)], -4);
        assert_eq!(seq.pop().await, Some(BlockRange::new(9, 6)));
        assert_eq!(seq.pop().await, None);
        assert_eq!(seq.pop().await, None);
    }

    #[tokio::test]
    async fn queued_range_comes_back_at_the_tail() {
        let seq = Sequence::new_finite(&[BlockRange::new(8, 1)], -4);
        let first = seq.pop().await.unwrap();
        assert_eq!(first, BlockRange::new(8, 5));
        seq.queue(first).await;
        assert_eq!(seq.pop().await, Some(BlockRange::new(4, 1)));
        assert_eq!(seq.pop().await, Some(BlockRange::new(8, 5)));
        assert_eq!(seq.pop().await, None);
    }

    #[tokio::test]
    async fn infinite_sequence_advances_until_capped() {
        let seq = Sequence::new_infinite(100, 2);
        assert_eq!(seq.pop().await, Some(BlockRange::new(100, 101)));
        assert_eq!(seq.pop().await, Some(BlockRange::new(102, 103)));
        seq.cap().await;
        assert_eq!(seq.pop().await, None);
    }

    #[tokio::test]
    async fn concurrent_pops_see_distinct_ranges() {
        let seq = Sequence::new_finite(&[BlockRange::new(63, 0)], -8);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = seq.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(range) = seq.pop().await {
                        seen.push(range);
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_by_key(|r| r.last);
        let firsts: Vec<u64> = all.iter().map(|r| r.first).collect();
        assert_eq!(firsts, vec![7, 15, 23, 31, 39, 47, 55, 63]);
    }
}
