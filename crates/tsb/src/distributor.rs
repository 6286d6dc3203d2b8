//! Process-local hand-off to out-of-process analysis workers.
//!
//! Backed by `tsb_communication::queue::Queue<T>` — a shared-memory seqlock
//! ring sized to hold at least `desc_cap` outstanding work items. A
//! `ComputeBuilder` configured without a local worker pool (`--drop`) instead
//! synthesizes completions immediately; see `ItemDistributor::dropped`.

use std::collections::VecDeque;

use tsb_communication::queue::{ConsumerBare, Producer, Queue, QueueType};

use crate::error::BuilderError;

pub type ItemId = u64;

/// Handed to a local worker: everything it needs to locate and interpret one
/// built timeslice in the compute node's shared-memory data/desc rings.
/// The per-component `TimesliceComponentDescriptor`s are already in place in
/// the desc ring; the worker reads them by `(component, ts_pos)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimesliceWorkItem {
    pub ts_pos: u64,
    pub ts_index: u64,
    pub timeslice_size: u64,
    pub num_components: u32,
    pub data_size_exp: u32,
    pub desc_size_exp: u32,
}

impl TimesliceWorkItem {
    /// Sentinel posted on shutdown so a blocked worker returns to its caller
    /// cleanly instead of waiting forever.
    pub const SHUTDOWN: Self = Self {
        ts_pos: u64::MAX,
        ts_index: 0,
        timeslice_size: 0,
        num_components: 0,
        data_size_exp: 0,
        desc_size_exp: 0,
    };

    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        self.ts_pos == u64::MAX
    }
}

/// Returned by a worker once it has consumed a timeslice in place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimesliceCompletion {
    pub ts_pos: u64,
}

/// The compute-node-side half of the work-item/completion channel: posts
/// work items, polls for completions.
pub enum ItemDistributor {
    /// Real shared-memory queues; workers are separate processes attached by
    /// shm id.
    Queued {
        work_items: Producer<TimesliceWorkItem>,
        completions: ConsumerBare<TimesliceCompletion>,
        capacity: usize,
        outstanding: usize,
    },
    /// No local worker pool: every posted work item is completed immediately,
    /// making the data flow lossless but the retention window equal to a
    /// single ring fill.
    Dropped { synthesized: VecDeque<ItemId> },
}

impl ItemDistributor {
    /// Opens (creating if necessary) the `<id>_work_items` / `<id>_completions`
    /// shared-memory queues for a compute node, sized `depth` (rounded up to
    /// a power of two) so it can always hold at least the configured
    /// descriptor capacity.
    #[must_use]
    pub fn shared(app_name: &str, depth: usize) -> Self {
        let depth = depth.next_power_of_two().max(2);
        let work_items: Queue<TimesliceWorkItem> =
            tsb_communication::shmem_queue(app_name, depth, QueueType::SPMC);
        let completions: Queue<TimesliceCompletion> =
            tsb_communication::shmem_queue(app_name, depth, QueueType::MPMC);
        Self::Queued {
            work_items: work_items.into(),
            completions: completions.into(),
            capacity: depth,
            outstanding: 0,
        }
    }

    #[must_use]
    pub fn dropped() -> Self {
        Self::Dropped { synthesized: VecDeque::new() }
    }

    /// Enqueues a work item for a local worker to pick up. Fails with
    /// `DistributorBackpressure` if the ring is already full of outstanding
    /// (unacknowledged) items — the ring is sized so this should not occur
    /// in steady state.
    pub fn post_work_item(&mut self, item: TimesliceWorkItem) -> Result<(), BuilderError> {
        match self {
            Self::Queued { work_items, capacity, outstanding, .. } => {
                if *outstanding >= *capacity {
                    return Err(BuilderError::DistributorBackpressure { outstanding: *outstanding });
                }
                work_items.produce(&item);
                *outstanding += 1;
                Ok(())
            }
            Self::Dropped { synthesized } => {
                synthesized.push_back(item.ts_pos);
                Ok(())
            }
        }
    }

    /// Non-blocking pop of a completion returned by a worker, if any.
    pub fn try_receive_completion(&mut self) -> Option<ItemId> {
        match self {
            Self::Queued { completions, outstanding, .. } => {
                let mut c = TimesliceCompletion::default();
                if completions.try_consume(&mut c).is_ok() {
                    *outstanding = outstanding.saturating_sub(1);
                    Some(c.ts_pos)
                } else {
                    None
                }
            }
            Self::Dropped { synthesized } => synthesized.pop_front(),
        }
    }

    /// Wakes any blocked workers with the zero-length sentinel so they
    /// return to their caller cleanly.
    pub fn shutdown(&mut self) {
        if let Self::Queued { work_items, .. } = self {
            work_items.produce(&TimesliceWorkItem::SHUTDOWN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_mode_completes_immediately_in_fifo_order() {
        let mut d = ItemDistributor::dropped();
        d.post_work_item(TimesliceWorkItem { ts_pos: 0, ..Default::default() }).unwrap();
        d.post_work_item(TimesliceWorkItem { ts_pos: 1, ..Default::default() }).unwrap();
        assert_eq!(d.try_receive_completion(), Some(0));
        assert_eq!(d.try_receive_completion(), Some(1));
        assert_eq!(d.try_receive_completion(), None);
    }

    #[test]
    fn shutdown_sentinel_is_recognisable() {
        assert!(TimesliceWorkItem::SHUTDOWN.is_shutdown());
        assert!(!TimesliceWorkItem { ts_pos: 0, ..Default::default() }.is_shutdown());
    }

    #[test]
    fn queued_mode_tracks_outstanding_against_capacity() {
        let q: Queue<TimesliceWorkItem> = Queue::new(2, QueueType::SPMC);
        let completions_q: Queue<TimesliceCompletion> = Queue::new(2, QueueType::MPMC);
        let mut d = ItemDistributor::Queued {
            work_items: q.into(),
            completions: completions_q.into(),
            capacity: 2,
            outstanding: 0,
        };
        d.post_work_item(TimesliceWorkItem { ts_pos: 0, ..Default::default() }).unwrap();
        d.post_work_item(TimesliceWorkItem { ts_pos: 1, ..Default::default() }).unwrap();
        let err = d.post_work_item(TimesliceWorkItem { ts_pos: 2, ..Default::default() });
        assert!(matches!(err, Err(BuilderError::DistributorBackpressure { outstanding: 2 })));
    }
}
