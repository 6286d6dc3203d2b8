//! Per-channel flow control: how much of the remote ring the sender may
//! still write into before it must wait for an ack.

use crate::wire::ComputeNodeBufferPosition;

/// Tracks the sender's view of one destination ring pair (data + desc).
///
/// `cn_wp` is the sender's own next-to-write pointer; `cn_ack` is the
/// sender's mirror of the receiver's last-reported read pointer;
/// `remote_ack` is the last `cn_ack` value the sender has actually
/// transmitted to the peer (kept so the sender knows when a fresh status
/// message would carry new information).
#[derive(Clone, Copy, Debug, Default)]
pub struct CreditWindow {
    pub data_cap: u64,
    pub desc_cap: u64,
    pub cn_wp: ComputeNodeBufferPosition,
    pub cn_ack: ComputeNodeBufferPosition,
    pub remote_ack: ComputeNodeBufferPosition,
}

impl CreditWindow {
    #[must_use]
    pub fn new(data_size_exp: u32, desc_size_exp: u32) -> Self {
        Self {
            data_cap: 1_u64 << data_size_exp,
            desc_cap: 1_u64 << desc_size_exp,
            cn_wp: ComputeNodeBufferPosition::default(),
            cn_ack: ComputeNodeBufferPosition::default(),
            remote_ack: ComputeNodeBufferPosition::default(),
        }
    }

    #[must_use]
    pub fn data_in_flight(&self) -> u64 {
        self.cn_wp.data - self.cn_ack.data
    }

    #[must_use]
    pub fn desc_in_flight(&self) -> u64 {
        self.cn_wp.desc - self.cn_ack.desc
    }

    /// Whether both a `data_bytes`-sized content write and a one-item desc
    /// write currently fit in the outstanding window.
    #[must_use]
    pub fn has_credit(&self, data_bytes: u64, desc_items: u64) -> bool {
        self.data_cap - self.data_in_flight() >= data_bytes
            && self.desc_cap - self.desc_in_flight() >= desc_items
    }

    /// Number of pad bytes needed so a `data_bytes` write does not span the
    /// remote data-ring wrap boundary; `0` if it already fits contiguously.
    #[must_use]
    pub fn skip_required(&self, data_bytes: u64) -> u64 {
        let offset = self.cn_wp.data & (self.data_cap - 1);
        if offset + data_bytes > self.data_cap { self.data_cap - offset } else { 0 }
    }

    /// Absorbs a newly received ack from the peer into `cn_ack`.
    pub fn on_ack_recv(&mut self, ack: ComputeNodeBufferPosition) {
        self.cn_ack = ack;
    }

    /// Whether the last transmitted `cn_wp` is stale relative to the
    /// current one — i.e. whether a status message would carry new
    /// information.
    #[must_use]
    pub fn has_unsent_progress(&self) -> bool {
        self.remote_ack != self.cn_wp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_credit_respects_caps() {
        let mut w = CreditWindow::new(4, 2); // data_cap 16, desc_cap 4
        assert!(w.has_credit(16, 4));
        assert!(!w.has_credit(17, 4));
        w.cn_wp.data = 10;
        assert!(w.has_credit(6, 1));
        assert!(!w.has_credit(7, 1));
    }

    #[test]
    fn skip_required_matches_wrap_padding_scenario() {
        // data_buffer_size_exp = 10 (1024), cn_wp.data = 1020, write 40 bytes.
        let mut w = CreditWindow::new(10, 4);
        w.cn_wp.data = 1020;
        assert_eq!(w.skip_required(40), 4);
        assert_eq!(w.skip_required(4), 0);
    }

    #[test]
    fn ack_never_exceeds_cap_difference() {
        let mut w = CreditWindow::new(4, 2);
        w.cn_wp.data = 16;
        w.cn_wp.desc = 4;
        assert!(!w.has_credit(1, 1));
        w.on_ack_recv(ComputeNodeBufferPosition { data: 4, desc: 1 });
        assert!(w.has_credit(4, 1));
    }
}
