//! `InputBuilder`: the per-input-node aggregate that reads
//! time-ordered microslices out of a [`TimesliceSource`], assigns each
//! timeslice to a compute node, and drives the `InputChannel` send/ack
//! lifecycle for all `N_out` destinations.

use crate::{
    channel::{InputChannel, TimesliceSendPlan},
    error::BuilderError,
    heartbeat::redistribute_round_robin,
    ring::RingBuffer,
    source::TimesliceSource,
    wire::{ComputeNodeBufferPosition, ComputeNodeStatusMessage, HeartbeatFailureInfo, MicrosliceDescriptor},
};

const EMPTY: u64 = u64::MAX;

/// Everything the caller needs to physically issue the writes for one
/// timeslice: which channel they're headed to, and the source byte ranges to
/// copy, computed by `InputChannel::send_timeslice`.
#[derive(Clone, Debug)]
pub struct InputSendEvent {
    pub channel: usize,
    pub ts_pos: u64,
    pub plan: TimesliceSendPlan,
}

pub struct InputBuilder<S> {
    channels: Vec<InputChannel>,
    ack_ring: RingBuffer<u64>,
    sent_bytes: RingBuffer<u64>,
    sent_desc: u64,
    sent_data: u64,
    acked_desc: u64,
    acked_data: u64,
    cached_acked_desc: u64,
    cached_acked_data: u64,
    start_index_desc: u64,
    start_index_data: u64,
    sync_threshold_desc: u64,
    sync_threshold_data: u64,
    timeslice_size: u64,
    overlap: u64,
    max_timeslice_number: Option<u64>,
    abort_requested: bool,
    source: S,
}

impl<S: TimesliceSource> InputBuilder<S> {
    #[must_use]
    pub fn new(
        num_out: usize,
        data_size_exp: u32,
        desc_size_exp: u32,
        max_pending_writes: u32,
        ack_ring_size_exp: u32,
        timeslice_size: u64,
        overlap: u64,
        max_timeslice_number: Option<u64>,
        source: S,
    ) -> Self {
        let channels = (0..num_out)
            .map(|i| InputChannel::new(i, data_size_exp, desc_size_exp, max_pending_writes))
            .collect();
        let mut ack_ring: RingBuffer<u64> = RingBuffer::new(ack_ring_size_exp);
        for i in 0..ack_ring.size() {
            *ack_ring.at_mut(i) = EMPTY;
        }
        let sent_bytes: RingBuffer<u64> = RingBuffer::new(ack_ring_size_exp);
        Self {
            channels,
            ack_ring,
            sent_bytes,
            sent_desc: 0,
            sent_data: 0,
            acked_desc: 0,
            acked_data: 0,
            cached_acked_desc: 0,
            cached_acked_data: 0,
            start_index_desc: 0,
            start_index_data: 0,
            sync_threshold_desc: 1,
            sync_threshold_data: 1,
            timeslice_size,
            overlap,
            max_timeslice_number,
            abort_requested: false,
            source,
        }
    }

    #[must_use]
    pub fn channel(&self, index: usize) -> &InputChannel {
        &self.channels[index]
    }

    /// Records the peer's `ComputeNodeInfo` (remote ring sizes) once the
    /// connect handshake for `channel` completes.
    pub fn on_channel_connected(&mut self, channel: usize, info: crate::wire::ComputeNodeInfo) {
        self.channels[channel].on_connected(info);
    }

    #[must_use]
    pub fn sent_desc(&self) -> u64 {
        self.sent_desc
    }

    #[must_use]
    pub fn acked_desc(&self) -> u64 {
        self.acked_desc
    }

    #[must_use]
    pub fn acked_data(&self) -> u64 {
        self.acked_data
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Sets the out-of-order fold thresholds at which `sync_source_if_due`
    /// actually publishes new read indexes, trading source-buffer headroom
    /// for fewer index-publish round trips.
    pub fn set_sync_thresholds(&mut self, desc: u64, data: u64) {
        self.sync_threshold_desc = desc.max(1);
        self.sync_threshold_data = data.max(1);
    }

    /// Step 1 of the main loop: if the source has produced every microslice
    /// in `[ts*T, ts*T+T+overlap)` and the assigned channel has room, posts
    /// the transfer and returns the event describing it. Swallows
    /// `BackpressureFull`, recovered locally by retrying next tick.
    pub fn maybe_send(&mut self, ts: u64) -> Result<Option<InputSendEvent>, BuilderError> {
        let start = ts * self.timeslice_size;
        let count = self.timeslice_size + self.overlap;
        let required = start + count;
        if self.source.desc_buffer().write_index() < required {
            return Ok(None);
        }

        let first = *self.source.desc_buffer().at(start);
        let last = *self.source.desc_buffer().at(start + count - 1);
        let content_src_start = first.offset;
        let content_len = last.offset + u64::from(last.size) - first.offset;
        let content_ring_size = self.source.data_buffer().size();

        let desc_item_size = MicrosliceDescriptor::WIRE_SIZE as u64;
        let desc_block_src_start = start * desc_item_size;
        let desc_block_len = count * desc_item_size;
        let desc_block_ring_size = self.source.desc_buffer().size() * desc_item_size;

        let Some(channel_index) = self.assign(ts) else {
            // every destination has been declared failed; nothing to do
            // until the fleet is redistributed further or the run ends.
            return Ok(None);
        };
        let channel = &mut self.channels[channel_index];
        let plan = match channel.send_timeslice(
            desc_block_src_start,
            desc_block_len,
            desc_block_ring_size,
            content_src_start,
            content_len,
            content_ring_size,
            ts,
            count,
        ) {
            Ok(plan) => plan,
            Err(BuilderError::BackpressureFull { .. }) => return Ok(None),
            Err(other) => return Err(other),
        };

        let owned_bytes = self.owned_byte_span(start);
        *self.sent_bytes.at_mut(self.sent_desc) = owned_bytes;
        self.sent_desc += 1;
        self.sent_data += owned_bytes;

        Ok(Some(InputSendEvent { channel: channel_index, ts_pos: ts, plan }))
    }

    /// Default assignment is round-robin over all channels (`assign(T) = T
    /// mod N_out`); once any channel has been declared failed by a
    /// heartbeat failure decision, assignment instead round-robins over the
    /// surviving channels only, so every timeslice still lands somewhere.
    /// Returns `None` only if every channel has failed.
    fn assign(&self, ts: u64) -> Option<usize> {
        let surviving: Vec<usize> =
            self.channels.iter().enumerate().filter(|(_, c)| !c.failed).map(|(i, _)| i).collect();
        redistribute_round_robin(ts, &surviving)
    }

    /// Marks `channel` failed per a delivered heartbeat failure decision:
    /// it is excluded from `assign` from this point on, matching §4.7's
    /// "redistributes the affected timeslices across the surviving channels
    /// in round-robin order". Any writes already in flight to this channel
    /// are simply abandoned; the channel never contributes a final status
    /// and is treated as already done.
    pub fn mark_channel_failed(&mut self, channel: usize) {
        tracing::warn!(channel, "marking destination compute node failed");
        self.channels[channel].mark_failed();
    }

    /// Builds this input node's report of the given channel's compute node
    /// being observed as timed out (§4.7): how many component descriptors
    /// this node has itself already written to `channel` (`cn_wp.desc` —
    /// its own send progress, which by construction no node ever needs to
    /// roll back past) and the timeslice index at which this node can
    /// safely stop assigning new work there.
    #[must_use]
    pub fn failure_report(&self, channel: usize, current_ts: u64) -> HeartbeatFailureInfo {
        HeartbeatFailureInfo {
            index: channel as u32,
            last_completed_desc: self.channels[channel].credit.cn_wp.desc,
            timeslice_trigger: current_ts,
        }
    }

    /// Bytes owned exclusively by timeslice `ts` (its non-overlap
    /// microslices `[ts*T, (ts+1)*T)`) — the portion safe to free from the
    /// source once `ts` is fully acknowledged, since the overlap region is
    /// shared with the next timeslice.
    fn owned_byte_span(&self, start: u64) -> u64 {
        if self.timeslice_size == 0 {
            return 0;
        }
        let first = *self.source.desc_buffer().at(start);
        let last = *self.source.desc_buffer().at(start + self.timeslice_size - 1);
        last.offset + u64::from(last.size) - first.offset
    }

    /// Step 2: folds a local write-completion notification (`ID_WRITE_DESC`)
    /// for `ts_pos` into `acked_desc`/`acked_data`, identical in shape to
    /// `ComputeBuilder`'s out-of-order completion fold, then releases
    /// the channel's pending-write slot.
    pub fn on_write_complete(&mut self, channel: usize, ts_pos: u64) {
        self.channels[channel].on_complete_write();

        if ts_pos != self.acked_desc {
            *self.ack_ring.at_mut(ts_pos) = ts_pos;
            return;
        }

        let Self { acked_desc, acked_data, ack_ring, sent_bytes, .. } = self;
        *acked_data += *sent_bytes.at(*acked_desc);
        *acked_desc += 1;
        while *ack_ring.at(*acked_desc) == *acked_desc {
            *acked_data += *sent_bytes.at(*acked_desc);
            *ack_ring.at_mut(*acked_desc) = EMPTY;
            *acked_desc += 1;
        }
    }

    /// Step 3: if acked progress has crossed either threshold since the last
    /// publish, advances the source's read indexes and records the new
    /// cached watermark.
    pub fn sync_source_if_due(&mut self) {
        let desc_due = self.acked_desc >= self.cached_acked_desc + self.sync_threshold_desc;
        let data_due = self.acked_data >= self.cached_acked_data + self.sync_threshold_data;
        if !desc_due && !data_due {
            return;
        }
        self.source.set_desc_read_index(self.start_index_desc + self.acked_desc * self.timeslice_size);
        self.source.set_data_read_index(self.start_index_data + self.acked_data);
        self.cached_acked_desc = self.acked_desc;
        self.cached_acked_data = self.acked_data;
    }

    /// Gives the source a chance to produce more microslices.
    pub fn run_scheduler(&mut self) {
        self.source.proceed();
    }

    /// Collects the `InputChannelStatusMessage` payloads ready to send, one
    /// per channel whose turn it is to speak.
    pub fn drain_pending_status(&mut self) -> Vec<(usize, ComputeNodeBufferPosition)> {
        self.channels
            .iter_mut()
            .enumerate()
            .filter_map(|(i, ch)| ch.try_sync_positions().map(|wp| (i, wp)))
            .collect()
    }

    pub fn on_status_recv(&mut self, channel: usize, msg: &ComputeNodeStatusMessage) {
        self.channels[channel].on_status_recv(msg);
    }

    /// Requests an (optionally aborting) finalize of every channel. Called
    /// once `ts` has run past `max_timeslice_number`, or when an abort is
    /// requested out of band (e.g. by the failure-decision protocol).
    pub fn request_finalize(&mut self, abort: bool) {
        tracing::info!(abort, "finalizing all channels");
        self.abort_requested = abort;
        for ch in &mut self.channels {
            ch.finalize(abort);
        }
    }

    #[must_use]
    pub fn should_finalize(&self, ts: u64) -> bool {
        self.abort_requested || self.max_timeslice_number.is_some_and(|max| ts > max)
    }

    /// Whether every channel has completed its final handshake: once every
    /// channel's final status has been acknowledged, the builder exits its
    /// loop.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.channels.iter().all(|ch| ch.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SyntheticSource;

    fn builder(num_out: usize, max: Option<u64>) -> InputBuilder<SyntheticSource> {
        let source = SyntheticSource::new(12, 20, 64, None);
        InputBuilder::new(num_out, 16, 8, 8, 8, 4, 1, max, source)
    }

    #[test]
    fn maybe_send_waits_for_source_then_assigns_round_robin() {
        let mut b = builder(2, None);
        assert!(b.maybe_send(0).unwrap().is_none()); // source hasn't produced anything yet

        b.run_scheduler();
        let ev0 = b.maybe_send(0).unwrap().expect("enough microslices for ts 0");
        assert_eq!(ev0.channel, 0);
        assert_eq!(ev0.ts_pos, 0);

        let ev1 = b.maybe_send(1).unwrap().expect("ts 1 also covered, overlap included");
        assert_eq!(ev1.channel, 1);
    }

    #[test]
    fn out_of_order_write_completion_folds_like_compute_builder() {
        let mut b = builder(1, None);
        b.run_scheduler();
        b.maybe_send(0).unwrap();
        b.maybe_send(1).unwrap();

        b.on_write_complete(0, 1); // ts 1 completes first
        assert_eq!(b.acked_desc(), 0);
        b.on_write_complete(0, 0); // ts 0 completes; both fold through
        assert_eq!(b.acked_desc(), 2);
        assert!(b.acked_data() > 0);
    }

    #[test]
    fn finalize_flush_matches_spec_scenario_6() {
        let mut b = builder(1, Some(0));
        assert!(!b.should_finalize(0));
        assert!(b.should_finalize(1));
        b.request_finalize(false);
        assert!(b.channel(0).finalize);
        // no outstanding writes -> channel considers itself immediately
        // eligible to send its final status
        assert!(b.channel(0).should_send_final());
    }

    #[test]
    fn assignment_redistributes_round_robin_after_failure() {
        let mut b = builder(3, None);
        assert_eq!(b.assign(0), Some(0));
        assert_eq!(b.assign(1), Some(1));
        assert_eq!(b.assign(2), Some(2));

        b.mark_channel_failed(1);
        // surviving = [0, 2]; ts now round-robins only across those
        assert_eq!(b.assign(0), Some(0));
        assert_eq!(b.assign(1), Some(2));
        assert_eq!(b.assign(2), Some(0));
        assert!(b.channel(1).failed);
        assert!(b.channel(1).done);
    }

    #[test]
    fn failure_report_reflects_local_ack_progress() {
        let mut b = builder(1, None);
        b.run_scheduler();
        b.maybe_send(0).unwrap();
        b.on_write_complete(0, 0);
        let report = b.failure_report(0, 5);
        assert_eq!(report.index, 0);
        assert_eq!(report.last_completed_desc, b.channel(0).credit.cn_wp.desc);
        assert_eq!(report.timeslice_trigger, 5);
    }

    #[test]
    fn sync_source_if_due_publishes_once_threshold_crossed() {
        let mut b = builder(1, None);
        b.set_sync_thresholds(1, 1);
        b.run_scheduler();
        b.maybe_send(0).unwrap();
        b.on_write_complete(0, 0);
        b.sync_source_if_due();
        assert_eq!(b.source().desc_buffer().read_index(), b.timeslice_size);
    }
}
