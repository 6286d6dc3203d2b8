use tsb_utils::ArrayVec;

use crate::{
    credit::CreditWindow,
    error::BuilderError,
    wire::{ComputeNodeBufferPosition, ComputeNodeInfo, ComputeNodeStatusMessage, TimesliceComponentDescriptor},
};

/// One contiguous local-source-to-remote-ring byte copy. The source side may
/// need up to two of these per logical block (descriptor headers, content)
/// when the local read range spans that ring's own wrap boundary.
#[derive(Clone, Copy, Debug)]
pub struct TimesliceWriteSegment {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub len: u64,
}

/// Everything an `InputBuilder` needs to actually issue the one-sided writes
/// for one timeslice component, computed by [`InputChannel::send_timeslice`].
#[derive(Clone, Debug)]
pub struct TimesliceSendPlan {
    pub desc_block_segments: ArrayVec<TimesliceWriteSegment, 2>,
    pub content_segments: ArrayVec<TimesliceWriteSegment, 2>,
    pub component_desc_slot: u64,
    pub component_descriptor: TimesliceComponentDescriptor,
}

/// Per-destination sender endpoint on the input side.
///
/// `our_turn` toggles with each full request/response status exchange,
/// enforcing exactly one outstanding status message per channel.
#[derive(Debug)]
pub struct InputChannel {
    pub index: usize,
    pub credit: CreditWindow,
    pub remote_info: Option<ComputeNodeInfo>,
    pub our_turn: bool,
    pub finalize: bool,
    pub abort: bool,
    pub pending_writes: u32,
    pub max_pending_writes: u32,
    pub done: bool,
    /// Set once a heartbeat failure decision names this channel's compute
    /// node as failed; excluded from round-robin assignment from that point
    /// on (§4.7).
    pub failed: bool,
}

impl InputChannel {
    #[must_use]
    pub fn new(index: usize, data_size_exp: u32, desc_size_exp: u32, max_pending_writes: u32) -> Self {
        Self {
            index,
            credit: CreditWindow::new(data_size_exp, desc_size_exp),
            remote_info: None,
            our_turn: true,
            finalize: false,
            abort: false,
            pending_writes: 0,
            max_pending_writes,
            done: false,
            failed: false,
        }
    }

    pub fn on_connected(&mut self, info: ComputeNodeInfo) {
        self.remote_info = Some(info);
    }

    /// Marks the compute node behind this channel failed per a delivered
    /// heartbeat failure decision. No further sends are routed here and the
    /// channel is treated as already done for finalize-wait purposes.
    pub fn mark_failed(&mut self) {
        self.failed = true;
        self.done = true;
    }

    #[must_use]
    pub fn has_credit(&self, data_bytes: u64, desc_items: u64) -> bool {
        self.credit.has_credit(data_bytes, desc_items)
    }

    #[must_use]
    pub fn skip_required(&self, data_bytes: u64) -> u64 {
        self.credit.skip_required(data_bytes)
    }

    /// Computes the remote write plan for one timeslice component and
    /// updates `cn_wp`/`pending_writes` accordingly. Does not itself touch
    /// the transport; the caller (`InputBuilder`) issues the actual
    /// one-sided writes from the returned plan, splitting its own source
    /// ring reads across `desc_block_segments`/`content_segments`.
    pub fn send_timeslice(
        &mut self,
        desc_block_src_start: u64,
        desc_block_len: u64,
        desc_block_ring_size: u64,
        content_src_start: u64,
        content_len: u64,
        content_ring_size: u64,
        ts_num: u64,
        num_microslices: u64,
    ) -> Result<TimesliceSendPlan, BuilderError> {
        let total_bytes = desc_block_len + content_len;
        if !self.has_credit(total_bytes, 1) || self.pending_writes >= self.max_pending_writes {
            return Err(BuilderError::BackpressureFull { channel: self.index });
        }

        let skip = self.skip_required(total_bytes);
        let dst_start = self.credit.cn_wp.data + skip;

        let desc_block_segments =
            split_source_segments(desc_block_src_start, desc_block_len, desc_block_ring_size, dst_start);
        let content_segments = split_source_segments(
            content_src_start,
            content_len,
            content_ring_size,
            dst_start + desc_block_len,
        );

        let component_descriptor = TimesliceComponentDescriptor {
            ts_num,
            offset: dst_start,
            size: total_bytes,
            num_microslices,
        };
        let component_desc_slot = self.credit.cn_wp.desc;

        self.credit.cn_wp.data += skip + total_bytes;
        self.credit.cn_wp.desc += 1;
        self.pending_writes += 1;

        Ok(TimesliceSendPlan {
            desc_block_segments,
            content_segments,
            component_desc_slot,
            component_descriptor,
        })
    }

    /// If it is our turn to speak, returns the status payload to send and
    /// clears `our_turn`. Also handles the finalize handshake: once both
    /// sides have drained (`cn_wp == cn_ack`, or abort is set), the returned
    /// message carries `final = true`.
    #[must_use]
    pub fn try_sync_positions(&mut self) -> Option<ComputeNodeBufferPosition> {
        if !self.our_turn {
            return None;
        }
        self.our_turn = false;
        Some(self.credit.cn_wp)
    }

    #[must_use]
    pub fn should_send_final(&self) -> bool {
        self.finalize && (self.credit.cn_wp == self.credit.cn_ack || self.abort)
    }

    pub fn finalize(&mut self, abort: bool) {
        self.finalize = true;
        self.abort = abort;
    }

    pub fn on_complete_write(&mut self) {
        self.pending_writes = self.pending_writes.saturating_sub(1);
    }

    /// Absorbs a status message from the compute node. Sets `our_turn` so
    /// the next loop iteration answers, unless the peer has declared the
    /// exchange final.
    pub fn on_status_recv(&mut self, msg: &ComputeNodeStatusMessage) {
        self.credit.on_ack_recv(msg.ack);
        if msg.is_final {
            self.done = true;
        } else {
            self.our_turn = true;
        }
    }
}

/// Splits a logical `[start, start+len)` read range of a ring of size
/// `ring_size` into one or two contiguous segments (two iff the range spans
/// the ring's own wrap boundary), each targeting consecutive bytes in the
/// destination starting at `dst_start`.
fn split_source_segments(
    start: u64,
    len: u64,
    ring_size: u64,
    dst_start: u64,
) -> ArrayVec<TimesliceWriteSegment, 2> {
    let mut segments = ArrayVec::new();
    if len == 0 {
        return segments;
    }
    let offset = start % ring_size;
    let tail = ring_size - offset;
    if tail >= len {
        segments.push(TimesliceWriteSegment { src_offset: offset, dst_offset: dst_start, len });
    } else {
        segments.push(TimesliceWriteSegment { src_offset: offset, dst_offset: dst_start, len: tail });
        segments.push(TimesliceWriteSegment {
            src_offset: 0,
            dst_offset: dst_start + tail,
            len: len - tail,
        });
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> InputChannel {
        InputChannel::new(0, 10, 4, 8) // data_cap 1024, desc_cap 16
    }

    #[test]
    fn send_timeslice_rejects_when_over_credit() {
        let mut ch = channel();
        ch.credit.cn_wp.data = 1020;
        // not enough desc credit makes this fail regardless of data room
        ch.credit.cn_wp.desc = 16; // at cap already
        let res = ch.send_timeslice(0, 0, 8, 0, 40, 1024, 0, 4);
        assert!(matches!(res, Err(BuilderError::BackpressureFull { .. })));
    }

    #[test]
    fn send_timeslice_pads_across_wrap_and_advances_cn_wp() {
        let mut ch = channel();
        ch.credit.cn_wp.data = 1020;
        let plan = ch.send_timeslice(0, 0, 8, 0, 40, 1024, 0, 4).unwrap();
        assert_eq!(plan.component_descriptor.offset, 1024); // skip padded to next cycle start
        assert_eq!(plan.component_descriptor.size, 40);
        assert_eq!(ch.credit.cn_wp.data, 1064);
        assert_eq!(ch.credit.cn_wp.desc, 1);
        assert_eq!(ch.pending_writes, 1);
    }

    #[test]
    fn ping_pong_our_turn_allows_exactly_one_outstanding_status() {
        let mut ch = channel();
        assert!(ch.try_sync_positions().is_some());
        assert!(ch.try_sync_positions().is_none());
        ch.on_status_recv(&ComputeNodeStatusMessage::default());
        assert!(ch.try_sync_positions().is_some());
    }

    #[test]
    fn split_source_segments_handles_local_wrap() {
        let segs = split_source_segments(1000, 40, 1024, 0);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].len, 24);
        assert_eq!(segs[1].len, 16);
    }
}
