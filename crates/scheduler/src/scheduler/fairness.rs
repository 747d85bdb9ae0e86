use std::time::{Duration, Instant};

use hwsched_core::{Priority, PriorityWeights};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: Instant,
    time: [Duration; Priority::COUNT],
}

impl Bucket {
    fn empty(start: Instant) -> Self {
        Self {
            start,
            time: [Duration::ZERO; Priority::COUNT],
        }
    }
}

/// Rolling record of time spent per priority class.
///
/// The window is a ring of buckets each covering `window / buckets` of wall
/// clock. Buckets are rotated lazily whenever the window is touched, so a
/// quiet period simply ages the old buckets out.
#[derive(Debug)]
pub(crate) struct FairnessWindow {
    buckets: Vec<Bucket>,
    current: usize,
    span: Duration,
}

impl FairnessWindow {
    pub(crate) fn new(window: Duration, buckets: usize) -> Self {
        Self::starting_at(window, buckets, Instant::now())
    }

    fn starting_at(window: Duration, buckets: usize, now: Instant) -> Self {
        let buckets = buckets.max(1);
        Self {
            buckets: vec![Bucket::empty(now); buckets],
            current: 0,
            span: window / buckets as u32,
        }
    }

    /// Charge `spent` to `priority`.
    pub(crate) fn record(&mut self, priority: Priority, spent: Duration) {
        self.record_at(priority, spent, Instant::now());
    }

    fn record_at(&mut self, priority: Priority, spent: Duration, now: Instant) {
        self.rotate(now);
        self.buckets[self.current].time[priority.index()] += spent;
    }

    /// Whether `priority` may still be picked in the budget pass.
    ///
    /// With `time(p)` the time charged to class `p` and `total(p)` the time
    /// charged to `p` and every lower class, a class is within budget while
    /// `weight(p) * total(p) >= 100 * time(p)`.
    pub(crate) fn within_budget(&mut self, priority: Priority, weights: &PriorityWeights) -> bool {
        self.within_budget_at(priority, weights, Instant::now())
    }

    fn within_budget_at(
        &mut self,
        priority: Priority,
        weights: &PriorityWeights,
        now: Instant,
    ) -> bool {
        self.rotate(now);
        let (spent, total) = self.totals(priority);
        let weight = u128::from(weights.for_priority(priority));
        weight * total.as_nanos() >= 100 * spent.as_nanos()
    }

    /// Time charged to each class over the whole window, indexed by
    /// [`Priority::index`].
    pub(crate) fn snapshot(&self) -> [Duration; Priority::COUNT] {
        let mut out = [Duration::ZERO; Priority::COUNT];
        for bucket in &self.buckets {
            for (slot, t) in out.iter_mut().zip(bucket.time.iter()) {
                *slot += *t;
            }
        }
        out
    }

    fn totals(&self, priority: Priority) -> (Duration, Duration) {
        let per_class = self.snapshot();
        let spent = per_class[priority.index()];
        let total = per_class[..=priority.index()].iter().sum();
        (spent, total)
    }

    fn rotate(&mut self, now: Instant) {
        let mut advanced = 0;
        while now.saturating_duration_since(self.buckets[self.current].start) > self.span {
            let next_start = if advanced + 1 >= self.buckets.len() {
                // Everything aged out; restart the ring at `now`.
                now
            } else {
                self.buckets[self.current].start + self.span
            };
            self.current = (self.current + 1) % self.buckets.len();
            self.buckets[self.current] = Bucket::empty(next_start);
            advanced += 1;
            if next_start == now {
                break;
            }
        }
    }
}
