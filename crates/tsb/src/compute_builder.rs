//! `ComputeBuilder` — the crux of the core: turns `N_in` independent,
//! out-of-order per-channel write-pointer streams into one monotonically
//! advancing "completely written" pointer (the red-lantern algorithm), hands
//! newly-complete timeslices to the [`ItemDistributor`], and folds
//! out-of-order worker completions back into an `acked` pointer that drives
//! per-channel credit release.

use tracing::instrument;

use crate::{
    channel::{ComputeChannel, ComputeChannelState},
    distributor::{ItemDistributor, TimesliceWorkItem},
    error::BuilderError,
    ring::RingBuffer,
    wire::{ComputeNodeBufferPosition, InputChannelStatusMessage, TimesliceComponentDescriptor},
};

/// Marks an `ack_ring` slot as not currently holding a pending out-of-order
/// completion marker for its position.
const EMPTY: u64 = u64::MAX;

/// Per-compute-node aggregate: owns one [`ComputeChannel`] (and its desc
/// ring) per input node, the red-lantern position, and the completion fold.
pub struct ComputeBuilder {
    channels: Vec<ComputeChannel>,
    desc_rings: Vec<RingBuffer<TimesliceComponentDescriptor>>,
    data_size_exp: u32,
    desc_size_exp: u32,
    red_lantern: usize,
    completely_written: u64,
    acked: u64,
    ack_ring: RingBuffer<u64>,
    distributor: ItemDistributor,
}

impl ComputeBuilder {
    #[must_use]
    pub fn new(
        num_inputs: usize,
        data_size_exp: u32,
        desc_size_exp: u32,
        ack_ring_size_exp: u32,
        distributor: ItemDistributor,
    ) -> Self {
        let channels =
            (0..num_inputs).map(|i| ComputeChannel::new(i, data_size_exp, desc_size_exp)).collect();
        let desc_rings = (0..num_inputs).map(|_| RingBuffer::new(desc_size_exp)).collect();
        let mut ack_ring: RingBuffer<u64> = RingBuffer::new(ack_ring_size_exp);
        for i in 0..ack_ring.size() {
            *ack_ring.at_mut(i) = EMPTY;
        }
        Self {
            channels,
            desc_rings,
            data_size_exp,
            desc_size_exp,
            red_lantern: 0,
            completely_written: 0,
            acked: 0,
            ack_ring,
            distributor,
        }
    }

    #[must_use]
    pub fn channel(&self, index: usize) -> &ComputeChannel {
        &self.channels[index]
    }

    /// Records the peer's `InputNodeInfo` once the connect handshake for
    /// `channel` completes, transitioning it `Connecting -> Established`.
    pub fn on_channel_connected(&mut self, channel: usize, info: crate::wire::InputNodeInfo) {
        self.channels[channel].on_connected(info);
    }

    #[must_use]
    pub fn completely_written(&self) -> u64 {
        self.completely_written
    }

    #[must_use]
    pub fn acked(&self) -> u64 {
        self.acked
    }

    #[must_use]
    pub fn red_lantern(&self) -> usize {
        self.red_lantern
    }

    /// Records a `TimesliceComponentDescriptor` received (by one-sided write)
    /// from input `channel` into slot `slot` of its desc ring. Must happen
    /// before the corresponding `on_wp_recv` that advances past `slot`,
    /// matching the FENCE ordering guarantee (payload strictly precedes its
    /// descriptor becoming visible, which in turn strictly precedes the
    /// `cn_wp` status message that references it).
    pub fn record_component_descriptor(
        &mut self,
        channel: usize,
        slot: u64,
        descriptor: TimesliceComponentDescriptor,
    ) {
        *self.desc_rings[channel].at_mut(slot) = descriptor;
    }

    /// Absorbs a `cn_wp` status update from `channel`. If `channel` is the
    /// current red lantern, recomputes the argmin over all live channels and
    /// emits work items for every timeslice newly proven complete.
    #[instrument(level = "debug", skip(self, msg), fields(red_lantern = self.red_lantern))]
    pub fn on_wp_recv(
        &mut self,
        channel: usize,
        msg: &InputChannelStatusMessage,
    ) -> Result<u64, BuilderError> {
        self.channels[channel].on_wp_recv(msg);
        if channel != self.red_lantern {
            return Ok(0);
        }
        let Some((lagging_index, new_completely_written)) = self.argmin_cn_wp_desc() else {
            return Ok(0);
        };

        let mut emitted = 0;
        for ts_pos in self.completely_written..new_completely_written {
            let item = self.build_work_item(ts_pos);
            self.distributor.post_work_item(item)?;
            emitted += 1;
        }
        self.red_lantern = lagging_index;
        self.completely_written = new_completely_written;
        if emitted > 0 {
            tracing::debug!(emitted, completely_written = self.completely_written, red_lantern = self.red_lantern, "advanced completely_written");
        }
        Ok(emitted)
    }

    /// The lowest-`cn_wp.desc` live (non-failed) channel, ties broken toward
    /// the lowest index — `Iterator::min_by_key` already returns the first
    /// minimal element on ties, which is exactly that rule.
    fn argmin_cn_wp_desc(&self) -> Option<(usize, u64)> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.failed)
            .min_by_key(|(_, c)| c.cn_wp.desc)
            .map(|(i, c)| (i, c.cn_wp.desc))
    }

    fn build_work_item(&self, ts_pos: u64) -> TimesliceWorkItem {
        let ts_index = self.desc_rings[0].at(ts_pos).ts_num;
        let timeslice_size = self.desc_rings.iter().map(|ring| ring.at(ts_pos).size).sum();
        TimesliceWorkItem {
            ts_pos,
            ts_index,
            timeslice_size,
            num_components: self.channels.len() as u32,
            data_size_exp: self.data_size_exp,
            desc_size_exp: self.desc_size_exp,
        }
    }

    /// Drains every completion currently available from the distributor,
    /// folding each into `acked`, which tracks completions out of order.
    pub fn poll_completions(&mut self) {
        while let Some(ts_pos) = self.distributor.try_receive_completion() {
            self.on_completion(ts_pos);
        }
    }

    fn on_completion(&mut self, ts_pos: u64) {
        if ts_pos != self.acked {
            *self.ack_ring.at_mut(ts_pos) = ts_pos;
            return;
        }

        let Self { acked, ack_ring, channels, desc_rings, .. } = self;
        *acked += 1;
        while *ack_ring.at(*acked) == *acked {
            *ack_ring.at_mut(*acked) = EMPTY;
            *acked += 1;
        }
        for (i, ch) in channels.iter_mut().enumerate() {
            ch.inc_ack(*acked, &desc_rings[i]);
            ch.our_turn = true;
        }
    }

    /// Collects the `cn_ack` status payloads ready to send, one per channel
    /// whose turn it is to speak (the ping-pong invariant applies on this
    /// side too: at most one status in flight per channel).
    pub fn drain_pending_acks(&mut self) -> Vec<(usize, ComputeNodeBufferPosition)> {
        self.channels
            .iter_mut()
            .enumerate()
            .filter_map(|(i, ch)| ch.post_ack().map(|ack| (i, ack)))
            .collect()
    }

    /// Channels `Draining` (peer sent its final status) and fully acked by
    /// this node (`cn_wp == cn_ack`): returns the final ack to send and
    /// transitions each to `Done` (§4.3's `Draining -> Done`).
    pub fn drain_final_acks(&mut self) -> Vec<(usize, ComputeNodeBufferPosition)> {
        self.channels
            .iter_mut()
            .enumerate()
            .filter_map(|(i, ch)| {
                if ch.should_send_final() {
                    let ack = ch.cn_ack;
                    ch.mark_final_sent();
                    Some((i, ack))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Whether every channel has completed its finalize handshake (reached
    /// `Done`) or never needs to (redistribution failure).
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.channels.iter().all(|ch| ch.state == ComputeChannelState::Done)
    }

    /// A transport-level disconnect on `channel` is fatal to builder progress
    /// unless the heartbeat layer has supplied a redistribution decision;
    /// once a decision is applied the channel is marked `Failed` here and
    /// excluded from the argmin, allowing `completely_written` to advance
    /// past timeslices the decision declares handled elsewhere. `timeslice_trigger`,
    /// when known (a consensus decision rather than a raw disconnect), caps
    /// that advance: positions at or past it are the ones the decision
    /// reassigns to a surviving compute node rather than this one, so no
    /// work item is emitted for them here.
    pub fn mark_channel_failed(&mut self, channel: usize, timeslice_trigger: Option<u64>) {
        tracing::warn!(channel, completely_written = self.completely_written, "marking channel failed");
        self.channels[channel].mark_failed();
        if channel != self.red_lantern {
            return;
        }
        let Some((lagging_index, new)) = self.argmin_cn_wp_desc() else { return };
        let ceiling = timeslice_trigger.map_or(new, |trigger| new.min(trigger));
        for ts_pos in self.completely_written..ceiling {
            let item = self.build_work_item(ts_pos);
            if let Err(err) = self.distributor.post_work_item(item) {
                tracing::warn!(ts_pos, ?err, "dropping work item while redistributing after channel failure");
                break;
            }
        }
        self.red_lantern = lagging_index;
        self.completely_written = self.completely_written.max(ceiling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ComputeNodeBufferPosition as Pos;

    fn wp_msg(desc: u64) -> InputChannelStatusMessage {
        InputChannelStatusMessage { wp: Pos { data: desc * 8, desc }, ..Default::default() }
    }

    fn seed_descriptors(builder: &mut ComputeBuilder, num_inputs: usize, upto: u64) {
        for ts in 0..upto {
            for ch in 0..num_inputs {
                builder.record_component_descriptor(
                    ch,
                    ts,
                    TimesliceComponentDescriptor { ts_num: ts, offset: ts * 8, size: 8, num_microslices: 4 },
                );
            }
        }
    }

    #[test]
    fn red_lantern_progress_matches_spec_scenario_4() {
        let mut b = ComputeBuilder::new(3, 16, 8, 8, ItemDistributor::dropped());
        seed_descriptors(&mut b, 3, 6);

        // senders reach cn_wp.desc = {5, 3, 4}; red_lantern starts at 0 by
        // construction, so drive it to the lagging channel 1 first.
        b.on_wp_recv(0, &wp_msg(5)).unwrap();
        assert_eq!(b.completely_written(), 0); // channel 0 isn't the red lantern yet... but it is initially
        // channel 0 is red_lantern at start, so this call already recomputed
        // the argmin over {5, 0, 0} = channel 1 (or 2, tie -> 1).
        assert_eq!(b.red_lantern(), 1);

        b.on_wp_recv(2, &wp_msg(4)).unwrap();
        assert_eq!(b.red_lantern(), 1); // channel 2 isn't red lantern, no recompute
        b.on_wp_recv(1, &wp_msg(3)).unwrap();
        assert_eq!(b.completely_written(), 3);
        assert_eq!(b.red_lantern(), 1); // argmin over {5,3,4} -> channel 1 stays laggard

        // sender 1 advances to 6; new min = 4 at index 2
        let emitted = b.on_wp_recv(1, &wp_msg(6)).unwrap();
        assert_eq!(emitted, 1); // ts_pos 3 emitted
        assert_eq!(b.completely_written(), 4);
        assert_eq!(b.red_lantern(), 2);
    }

    #[test]
    fn work_items_require_matching_ts_num_across_components() {
        let mut b = ComputeBuilder::new(2, 16, 8, 8, ItemDistributor::dropped());
        seed_descriptors(&mut b, 2, 1);
        for ch in 0..2 {
            assert_eq!(b.desc_rings[ch].at(0).ts_num, 0);
        }
    }

    #[test]
    fn out_of_order_completion_matches_spec_scenario_2() {
        let mut b = ComputeBuilder::new(1, 16, 8, 8, ItemDistributor::dropped());
        seed_descriptors(&mut b, 1, 2);
        b.on_completion(1);
        assert_eq!(b.acked(), 0); // out of order, just marked
        b.on_completion(0);
        assert_eq!(b.acked(), 2); // both fold through in one go
    }

    #[test]
    fn acked_never_exceeds_completely_written() {
        let mut b = ComputeBuilder::new(2, 16, 8, 8, ItemDistributor::dropped());
        seed_descriptors(&mut b, 2, 4);
        b.on_wp_recv(0, &wp_msg(2)).unwrap();
        b.on_wp_recv(1, &wp_msg(2)).unwrap();
        b.poll_completions();
        // two work items were posted to the (dropped) distributor and
        // immediately synthesized as completions
        b.poll_completions();
        assert!(b.acked() <= b.completely_written());
        assert_eq!(b.acked(), 2);
    }

    #[test]
    fn failed_channel_is_excluded_from_argmin() {
        let mut b = ComputeBuilder::new(3, 16, 8, 8, ItemDistributor::dropped());
        seed_descriptors(&mut b, 3, 10);
        b.on_wp_recv(0, &wp_msg(5)).unwrap();
        b.on_wp_recv(2, &wp_msg(4)).unwrap();
        // channel 1 never advances past 0 and gets declared failed
        b.mark_channel_failed(1, None);
        assert_eq!(b.completely_written(), 4);
        assert_eq!(b.red_lantern(), 2);
    }

    #[test]
    fn failed_channel_emits_work_items_for_newly_complete_range() {
        let mut b = ComputeBuilder::new(3, 16, 8, 8, ItemDistributor::dropped());
        seed_descriptors(&mut b, 3, 10);
        b.on_wp_recv(0, &wp_msg(5)).unwrap();
        b.on_wp_recv(2, &wp_msg(4)).unwrap();
        b.mark_channel_failed(1, None);
        // completely_written jumped from 0 to 4; ts_pos 0..4 must have been
        // posted as work items, not silently dropped.
        b.poll_completions();
        assert_eq!(b.acked(), 4);
    }

    #[test]
    fn failed_channel_respects_redistribution_trigger_ceiling() {
        let mut b = ComputeBuilder::new(3, 16, 8, 8, ItemDistributor::dropped());
        seed_descriptors(&mut b, 3, 10);
        b.on_wp_recv(0, &wp_msg(5)).unwrap();
        b.on_wp_recv(2, &wp_msg(4)).unwrap();
        // trigger caps the advance below the surviving argmin of 4: ts_pos 3
        // is reassigned elsewhere, so only 0..3 should be built here.
        b.mark_channel_failed(1, Some(3));
        assert_eq!(b.completely_written(), 3);
        b.poll_completions();
        assert_eq!(b.acked(), 3);
    }
}
