use std::collections::VecDeque;

use hwsched_core::{Lane, Priority};

use super::types::SyncHandle;

/// One FIFO per (priority class, lane).
///
/// Only Ready tasks live here. A worker removes a task before running it,
/// so a queued handle is never also running.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueues {
    queues: [[VecDeque<SyncHandle>; Lane::COUNT]; Priority::COUNT],
}

impl ReadyQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_back(&mut self, priority: Priority, lane: Lane, handle: SyncHandle) {
        self.queue_mut(priority, lane).push_back(handle);
    }

    /// Requeue at the head, so a task that asked to continue keeps its
    /// position ahead of later submissions.
    pub(crate) fn push_front(&mut self, priority: Priority, lane: Lane, handle: SyncHandle) {
        self.queue_mut(priority, lane).push_front(handle);
    }

    /// Remove and return the first handle in (priority, lane) accepted by
    /// `pred`.
    pub(crate) fn take_first<F>(
        &mut self,
        priority: Priority,
        lane: Lane,
        mut pred: F,
    ) -> Option<SyncHandle>
    where
        F: FnMut(SyncHandle) -> bool,
    {
        let queue = self.queue_mut(priority, lane);
        let pos = queue.iter().position(|h| pred(*h))?;
        queue.remove(pos)
    }

    /// Whether (priority, lane) holds a handle accepted by `pred`.
    pub(crate) fn any<F>(&self, priority: Priority, lane: Lane, pred: F) -> bool
    where
        F: FnMut(&SyncHandle) -> bool,
    {
        self.queue(priority, lane).iter().any(pred)
    }

    pub(crate) fn remove(&mut self, priority: Priority, lane: Lane, handle: SyncHandle) -> bool {
        let queue = self.queue_mut(priority, lane);
        match queue.iter().position(|h| *h == handle) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len_for(&self, priority: Priority) -> usize {
        self.queues[priority.index()].iter().map(VecDeque::len).sum()
    }

    pub(crate) fn len(&self) -> usize {
        Priority::ALL.iter().map(|p| self.len_for(*p)).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every queued handle, highest class first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = SyncHandle> + '_ {
        Priority::ALL.into_iter().flat_map(move |p| {
            Lane::ALL
                .into_iter()
                .flat_map(move |l| self.queue(p, l).iter().copied())
        })
    }

    pub(crate) fn drain(&mut self) -> Vec<SyncHandle> {
        let mut out = Vec::with_capacity(self.len());
        for class in self.queues.iter_mut() {
            for queue in class.iter_mut() {
                out.extend(queue.drain(..));
            }
        }
        out
    }

    fn queue(&self, priority: Priority, lane: Lane) -> &VecDeque<SyncHandle> {
        &self.queues[priority.index()][lane.index()]
    }

    fn queue_mut(&mut self, priority: Priority, lane: Lane) -> &mut VecDeque<SyncHandle> {
        &mut self.queues[priority.index()][lane.index()]
    }
}
