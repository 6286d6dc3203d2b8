//! Fixed-layout, little-endian wire structs exchanged between input and
//! compute nodes.
//!
//! Every struct here owns a `to_bytes`/`from_bytes` pair instead of a
//! generic serializer: the original used Boost serialization across the
//! wire, which this port replaces with plain byte layouts plus a version
//! byte on the three message types that cross the network directly
//! (`InputChannelStatusMessage`, `ComputeNodeStatusMessage`,
//! `HeartbeatMessage`). Everything else (`MicrosliceDescriptor`,
//! `TimesliceComponentDescriptor`, ...) lives inside a shared-memory ring and
//! is read by value, but keeps the same byte-level contract so a future
//! RDMA-backed `Transport` can register it as a memory region unmodified.

/// Opaque per-microslice header. The core only inspects `size` (byte
/// accounting) and `idx`; everything else passes through untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MicrosliceDescriptor {
    pub hdr_id: u8,
    pub hdr_ver: u8,
    pub eq_id: u16,
    pub flags: u16,
    pub sys_id: u8,
    pub sys_ver: u8,
    pub idx: u64,
    pub crc: u32,
    pub size: u32,
    pub offset: u64,
}

impl MicrosliceDescriptor {
    pub const WIRE_SIZE: usize = 32;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        buf[0] = self.hdr_id;
        buf[1] = self.hdr_ver;
        buf[2..4].copy_from_slice(&self.eq_id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_le_bytes());
        buf[6] = self.sys_id;
        buf[7] = self.sys_ver;
        buf[8..16].copy_from_slice(&self.idx.to_le_bytes());
        buf[16..20].copy_from_slice(&self.crc.to_le_bytes());
        buf[20..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            hdr_id: buf[0],
            hdr_ver: buf[1],
            eq_id: u16::from_le_bytes(buf[2..4].try_into().ok()?),
            flags: u16::from_le_bytes(buf[4..6].try_into().ok()?),
            sys_id: buf[6],
            sys_ver: buf[7],
            idx: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            crc: u32::from_le_bytes(buf[16..20].try_into().ok()?),
            size: u32::from_le_bytes(buf[20..24].try_into().ok()?),
            offset: u64::from_le_bytes(buf[24..32].try_into().ok()?),
        })
    }
}

/// Points into one compute buffer's contributing slice for one timeslice
/// component. Lives in the desc ring; read by workers as `(component,
/// ts_pos)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimesliceComponentDescriptor {
    pub ts_num: u64,
    pub offset: u64,
    pub size: u64,
    pub num_microslices: u64,
}

impl TimesliceComponentDescriptor {
    pub const WIRE_SIZE: usize = 32;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.ts_num.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.num_microslices.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            ts_num: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            offset: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            size: u64::from_le_bytes(buf[16..24].try_into().ok()?),
            num_microslices: u64::from_le_bytes(buf[24..32].try_into().ok()?),
        })
    }
}

/// Monotonic write-position counters: `desc` in items, `data` in bytes.
/// Never wrap in a run's lifetime (both are 64-bit).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComputeNodeBufferPosition {
    pub data: u64,
    pub desc: u64,
}

impl ComputeNodeBufferPosition {
    pub const WIRE_SIZE: usize = 16;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.data.to_le_bytes());
        buf[8..16].copy_from_slice(&self.desc.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            data: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            desc: u64::from_le_bytes(buf[8..16].try_into().ok()?),
        })
    }
}

/// Address/rkey pair carried inside `ComputeNodeInfo`. Under the TCP
/// `Transport` `rkey` is always `0` — there is no remote key to register —
/// but the field stays so the wire layout does not depend on which
/// `Transport` is plugged in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteMemoryRegion {
    pub addr: u64,
    pub rkey: u64,
}

impl RemoteMemoryRegion {
    pub const WIRE_SIZE: usize = 16;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..16].copy_from_slice(&self.rkey.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            addr: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            rkey: u64::from_le_bytes(buf[8..16].try_into().ok()?),
        })
    }
}

/// Connect private data sent from an input node to a compute node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputNodeInfo {
    pub index: u32,
}

impl InputNodeInfo {
    pub const WIRE_SIZE: usize = 4;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        self.index.to_le_bytes()
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self { index: u32::from_le_bytes(buf[0..4].try_into().ok()?) })
    }
}

/// Connect private data sent from a compute node back to an input node:
/// remote keys plus the negotiated ring-buffer size exponents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComputeNodeInfo {
    pub data: RemoteMemoryRegion,
    pub desc: RemoteMemoryRegion,
    pub index: u32,
    pub data_buffer_size_exp: u32,
    pub desc_buffer_size_exp: u32,
}

impl ComputeNodeInfo {
    pub const WIRE_SIZE: usize = RemoteMemoryRegion::WIRE_SIZE * 2 + 12;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        buf[0..16].copy_from_slice(&self.data.to_bytes());
        buf[16..32].copy_from_slice(&self.desc.to_bytes());
        buf[32..36].copy_from_slice(&self.index.to_le_bytes());
        buf[36..40].copy_from_slice(&self.data_buffer_size_exp.to_le_bytes());
        buf[40..44].copy_from_slice(&self.desc_buffer_size_exp.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            data: RemoteMemoryRegion::from_bytes(&buf[0..16])?,
            desc: RemoteMemoryRegion::from_bytes(&buf[16..32])?,
            index: u32::from_le_bytes(buf[32..36].try_into().ok()?),
            data_buffer_size_exp: u32::from_le_bytes(buf[36..40].try_into().ok()?),
            desc_buffer_size_exp: u32::from_le_bytes(buf[40..44].try_into().ok()?),
        })
    }
}

/// Status message sent sender (input) -> receiver (compute).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputChannelStatusMessage {
    pub wp: ComputeNodeBufferPosition,
    pub abort: bool,
    pub is_final: bool,
    pub connect: bool,
    pub info: InputNodeInfo,
}

impl InputChannelStatusMessage {
    pub const WIRE_VERSION: u8 = 1;
    pub const WIRE_SIZE: usize =
        1 + ComputeNodeBufferPosition::WIRE_SIZE + 3 + InputNodeInfo::WIRE_SIZE;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        buf[0] = Self::WIRE_VERSION;
        buf[1..17].copy_from_slice(&self.wp.to_bytes());
        buf[17] = u8::from(self.abort);
        buf[18] = u8::from(self.is_final);
        buf[19] = u8::from(self.connect);
        buf[20..24].copy_from_slice(&self.info.to_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE || buf[0] != Self::WIRE_VERSION {
            return None;
        }
        Some(Self {
            wp: ComputeNodeBufferPosition::from_bytes(&buf[1..17])?,
            abort: buf[17] != 0,
            is_final: buf[18] != 0,
            connect: buf[19] != 0,
            info: InputNodeInfo::from_bytes(&buf[20..24])?,
        })
    }
}

/// Status message sent receiver (compute) -> sender (input).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComputeNodeStatusMessage {
    pub ack: ComputeNodeBufferPosition,
    pub request_abort: bool,
    pub is_final: bool,
    pub connect: bool,
    pub info: ComputeNodeInfo,
}

impl ComputeNodeStatusMessage {
    pub const WIRE_VERSION: u8 = 1;
    pub const WIRE_SIZE: usize =
        1 + ComputeNodeBufferPosition::WIRE_SIZE + 3 + ComputeNodeInfo::WIRE_SIZE;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        buf[0] = Self::WIRE_VERSION;
        buf[1..17].copy_from_slice(&self.ack.to_bytes());
        buf[17] = u8::from(self.request_abort);
        buf[18] = u8::from(self.is_final);
        buf[19] = u8::from(self.connect);
        buf[20..20 + ComputeNodeInfo::WIRE_SIZE].copy_from_slice(&self.info.to_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE || buf[0] != Self::WIRE_VERSION {
            return None;
        }
        Some(Self {
            ack: ComputeNodeBufferPosition::from_bytes(&buf[1..17])?,
            request_abort: buf[17] != 0,
            is_final: buf[18] != 0,
            connect: buf[19] != 0,
            info: ComputeNodeInfo::from_bytes(&buf[20..20 + ComputeNodeInfo::WIRE_SIZE])?,
        })
    }
}

/// Consensus failure-decision payload carried inside a `HeartbeatMessage`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatFailureInfo {
    pub index: u32,
    pub last_completed_desc: u64,
    pub timeslice_trigger: u64,
}

impl HeartbeatFailureInfo {
    pub const WIRE_SIZE: usize = 20;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.index.to_le_bytes());
        buf[4..12].copy_from_slice(&self.last_completed_desc.to_le_bytes());
        buf[12..20].copy_from_slice(&self.timeslice_trigger.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            index: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            last_completed_desc: u64::from_le_bytes(buf[4..12].try_into().ok()?),
            timeslice_trigger: u64::from_le_bytes(buf[12..20].try_into().ok()?),
        })
    }
}

/// Liveness probe / ack, optionally carrying a failure decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatMessage {
    pub sender_index: u32,
    pub message_id: u64,
    pub ack: bool,
    pub failure_info: Option<HeartbeatFailureInfo>,
}

impl HeartbeatMessage {
    pub const WIRE_VERSION: u8 = 1;
    pub const WIRE_SIZE: usize = 1 + 4 + 8 + 1 + 1 + HeartbeatFailureInfo::WIRE_SIZE;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        buf[0] = Self::WIRE_VERSION;
        buf[1..5].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[5..13].copy_from_slice(&self.message_id.to_le_bytes());
        buf[13] = u8::from(self.ack);
        buf[14] = u8::from(self.failure_info.is_some());
        buf[15..15 + HeartbeatFailureInfo::WIRE_SIZE]
            .copy_from_slice(&self.failure_info.unwrap_or_default().to_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE || buf[0] != Self::WIRE_VERSION {
            return None;
        }
        let has_failure_info = buf[14] != 0;
        let failure_info = has_failure_info
            .then(|| HeartbeatFailureInfo::from_bytes(&buf[15..15 + HeartbeatFailureInfo::WIRE_SIZE]))
            .flatten();
        if has_failure_info && failure_info.is_none() {
            return None;
        }
        Some(Self {
            sender_index: u32::from_le_bytes(buf[1..5].try_into().ok()?),
            message_id: u64::from_le_bytes(buf[5..13].try_into().ok()?),
            ack: buf[13] != 0,
            failure_info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microslice_descriptor_round_trips() {
        let d = MicrosliceDescriptor {
            hdr_id: 0xDD,
            hdr_ver: 1,
            eq_id: 42,
            flags: 0,
            sys_id: 7,
            sys_ver: 1,
            idx: 1234,
            crc: 0xDEAD_BEEF,
            size: 8,
            offset: 4096,
        };
        assert_eq!(MicrosliceDescriptor::from_bytes(&d.to_bytes()), Some(d));
    }

    #[test]
    fn input_channel_status_message_round_trips() {
        let m = InputChannelStatusMessage {
            wp: ComputeNodeBufferPosition { data: 10, desc: 2 },
            abort: false,
            is_final: true,
            connect: false,
            info: InputNodeInfo { index: 3 },
        };
        assert_eq!(InputChannelStatusMessage::from_bytes(&m.to_bytes()), Some(m));
    }

    #[test]
    fn compute_node_status_message_round_trips() {
        let m = ComputeNodeStatusMessage {
            ack: ComputeNodeBufferPosition { data: 99, desc: 6 },
            request_abort: true,
            is_final: false,
            connect: true,
            info: ComputeNodeInfo {
                data: RemoteMemoryRegion { addr: 1, rkey: 0 },
                desc: RemoteMemoryRegion { addr: 2, rkey: 0 },
                index: 5,
                data_buffer_size_exp: 20,
                desc_buffer_size_exp: 10,
            },
        };
        assert_eq!(ComputeNodeStatusMessage::from_bytes(&m.to_bytes()), Some(m));
    }

    #[test]
    fn heartbeat_message_round_trips_with_and_without_failure_info() {
        let plain =
            HeartbeatMessage { sender_index: 1, message_id: 7, ack: false, failure_info: None };
        assert_eq!(HeartbeatMessage::from_bytes(&plain.to_bytes()), Some(plain));

        let with_info = HeartbeatMessage {
            sender_index: 1,
            message_id: 8,
            ack: true,
            failure_info: Some(HeartbeatFailureInfo {
                index: 2,
                last_completed_desc: 17,
                timeslice_trigger: 20,
            }),
        };
        assert_eq!(HeartbeatMessage::from_bytes(&with_info.to_bytes()), Some(with_info));
    }

    #[test]
    fn rejects_wrong_wire_version() {
        let m = InputChannelStatusMessage::default();
        let mut bytes = m.to_bytes();
        bytes[0] = 0xFF;
        assert_eq!(InputChannelStatusMessage::from_bytes(&bytes), None);
    }

    #[test]
    fn rejects_truncated_buffer() {
        let m = HeartbeatMessage::default();
        let bytes = m.to_bytes();
        assert_eq!(HeartbeatMessage::from_bytes(&bytes[..bytes.len() - 1]), None);
    }
}
