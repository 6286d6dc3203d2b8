use crate::{
    ring::RingBuffer,
    wire::{ComputeNodeBufferPosition, InputChannelStatusMessage, InputNodeInfo, TimesliceComponentDescriptor},
};

/// `ComputeChannel` lifecycle. Transitions are driven entirely by messages
/// received from the peer input node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ComputeChannelState {
    #[default]
    Connecting,
    Established,
    Draining,
    Done,
}

/// Per-source receiver endpoint on the compute side. Owns no memory itself —
/// the data/desc rings live on the `ComputeBuilder` that holds `N_in` of
/// these — just the bookkeeping positions and negotiated ring sizes.
#[derive(Debug)]
pub struct ComputeChannel {
    pub index: usize,
    pub state: ComputeChannelState,
    pub cn_wp: ComputeNodeBufferPosition,
    pub cn_ack: ComputeNodeBufferPosition,
    pub data_size_exp: u32,
    pub desc_size_exp: u32,
    pub remote_info: Option<InputNodeInfo>,
    pub our_turn: bool,
    pub failed: bool,
}

impl ComputeChannel {
    #[must_use]
    pub fn new(index: usize, data_size_exp: u32, desc_size_exp: u32) -> Self {
        Self {
            index,
            state: ComputeChannelState::Connecting,
            cn_wp: ComputeNodeBufferPosition::default(),
            cn_ack: ComputeNodeBufferPosition::default(),
            data_size_exp,
            desc_size_exp,
            remote_info: None,
            our_turn: false,
            failed: false,
        }
    }

    pub fn on_connected(&mut self, info: InputNodeInfo) {
        self.remote_info = Some(info);
        self.state = ComputeChannelState::Established;
    }

    /// Updates the local snapshot of the peer's write pointer. This is what
    /// feeds the red-lantern recomputation at the `ComputeBuilder` level.
    pub fn on_wp_recv(&mut self, msg: &InputChannelStatusMessage) {
        self.cn_wp = msg.wp;
        self.our_turn = true;
        if msg.is_final {
            self.state = ComputeChannelState::Draining;
        }
    }

    /// Sets `cn_ack.desc` and derives `cn_ack.data` as the byte offset just
    /// past the last fully-consumed component descriptor.
    pub fn inc_ack(&mut self, new_ack_desc: u64, desc_ring: &RingBuffer<TimesliceComponentDescriptor>) {
        self.cn_ack.desc = new_ack_desc;
        self.cn_ack.data = if new_ack_desc == 0 {
            0
        } else {
            let last = desc_ring.at(new_ack_desc - 1);
            last.offset + last.size
        };
    }

    /// If it is our turn to speak, returns the ack to send and clears
    /// `our_turn`.
    #[must_use]
    pub fn post_ack(&mut self) -> Option<ComputeNodeBufferPosition> {
        if !self.our_turn {
            return None;
        }
        self.our_turn = false;
        Some(self.cn_ack)
    }

    /// Whether this channel is ready for the `Draining -> Done` transition:
    /// the peer has declared final and this node has acked everything the
    /// peer sent.
    #[must_use]
    pub fn should_send_final(&self) -> bool {
        self.state == ComputeChannelState::Draining && self.cn_wp == self.cn_ack
    }

    pub fn mark_final_sent(&mut self) {
        self.state = ComputeChannelState::Done;
    }

    /// Marks the input node behind this channel failed. No further progress
    /// is expected from it, so it is treated as already `Done` for
    /// finalize-wait purposes.
    pub fn mark_failed(&mut self) {
        self.failed = true;
        self.state = ComputeChannelState::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_ack_derives_bytes_from_last_descriptor() {
        let mut desc_ring: RingBuffer<TimesliceComponentDescriptor> = RingBuffer::new(4);
        *desc_ring.at_mut(0) =
            TimesliceComponentDescriptor { ts_num: 0, offset: 0, size: 40, num_microslices: 4 };
        *desc_ring.at_mut(1) =
            TimesliceComponentDescriptor { ts_num: 1, offset: 40, size: 24, num_microslices: 4 };

        let mut ch = ComputeChannel::new(0, 10, 4);
        ch.inc_ack(2, &desc_ring);
        assert_eq!(ch.cn_ack.desc, 2);
        assert_eq!(ch.cn_ack.data, 64);
    }

    #[test]
    fn final_status_transitions_to_draining() {
        let mut ch = ComputeChannel::new(0, 10, 4);
        ch.on_connected(InputNodeInfo { index: 0 });
        assert_eq!(ch.state, ComputeChannelState::Established);
        let msg = InputChannelStatusMessage { is_final: true, ..Default::default() };
        ch.on_wp_recv(&msg);
        assert_eq!(ch.state, ComputeChannelState::Draining);
    }

    #[test]
    fn draining_waits_for_full_ack_before_final_send() {
        let mut ch = ComputeChannel::new(0, 10, 4);
        ch.on_connected(InputNodeInfo { index: 0 });
        let msg = InputChannelStatusMessage {
            is_final: true,
            wp: ComputeNodeBufferPosition { data: 64, desc: 2 },
            ..Default::default()
        };
        ch.on_wp_recv(&msg);
        // not yet fully acked: must not claim ready-to-finalize
        assert!(!ch.should_send_final());

        ch.cn_ack = ch.cn_wp;
        assert!(ch.should_send_final());
        ch.mark_final_sent();
        assert_eq!(ch.state, ComputeChannelState::Done);
        assert!(!ch.should_send_final());
    }
}
