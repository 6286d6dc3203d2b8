//! Swappable microslice source feeding an `InputBuilder`.
//!
//! A first-class trait rather than a concrete reader so `InputBuilder` stays
//! generic over where microslices come from, and a real detector front end
//! can be plugged in without touching builder code. `SyntheticSource` is the
//! reference implementation: a round-robin fixed-size item generator for
//! smoke-testing a fleet without real hardware behind it.

use crate::{ring::ManagedRingBuffer, wire::MicrosliceDescriptor};

/// A source of time-ordered microslices for one input node.
///
/// The source advances its own write indexes asynchronously (e.g. a real
/// detector front end filling buffers from hardware); the `InputBuilder`
/// advances the read indexes lazily, only once bytes have been acked by
/// every compute node that needed them.
pub trait TimesliceSource {
    /// Ring holding one `MicrosliceDescriptor` per microslice produced so far.
    fn desc_buffer(&self) -> &ManagedRingBuffer<MicrosliceDescriptor>;

    /// Ring holding the concatenated opaque microslice payload bytes.
    fn data_buffer(&self) -> &ManagedRingBuffer<u8>;

    /// Advances the descriptor ring's `read_index`, freeing source-side
    /// capacity. Only ever moves forward.
    fn set_desc_read_index(&mut self, index: u64);

    /// Advances the data ring's `read_index`, freeing source-side capacity.
    fn set_data_read_index(&mut self, index: u64);

    /// Gives the source a chance to produce more microslices (or, for a real
    /// front end, to poll hardware / a socket). Called once per scheduler
    /// tick from `InputBuilder::run_scheduler`.
    fn proceed(&mut self);
}

/// Generates microslices of a fixed size at a fixed cadence. Used by
/// integration tests and by `tsb-cli input --synthetic` to smoke-test a
/// fleet without a real detector front end.
pub struct SyntheticSource {
    desc: ManagedRingBuffer<MicrosliceDescriptor>,
    data: ManagedRingBuffer<u8>,
    microslice_size: u32,
    next_idx: u64,
    max_microslices: Option<u64>,
}

impl SyntheticSource {
    #[must_use]
    pub fn new(
        desc_size_exp: u32,
        data_size_exp: u32,
        microslice_size: u32,
        max_microslices: Option<u64>,
    ) -> Self {
        Self {
            desc: ManagedRingBuffer::new(desc_size_exp),
            data: ManagedRingBuffer::new(data_size_exp),
            microslice_size,
            next_idx: 0,
            max_microslices,
        }
    }

    /// Produces one more microslice if there is room and the configured
    /// limit has not been reached. Content bytes are zero-filled; only
    /// `size` drives downstream byte accounting.
    fn generate_one(&mut self) -> bool {
        if self.max_microslices.is_some_and(|max| self.next_idx >= max) {
            return false;
        }
        let size = u64::from(self.microslice_size);
        if self.desc.size_available() < 1 || self.data.size_available() < size {
            return false;
        }

        let offset = self.data.write_index();
        self.data.skip_buffer_wrap(size);
        let offset = self.data.write_index().max(offset);
        for _ in 0..size {
            self.data.append(0);
        }

        self.desc.append(MicrosliceDescriptor {
            hdr_id: 0xDD,
            hdr_ver: 0,
            eq_id: 0,
            flags: 0,
            sys_id: 0,
            sys_ver: 0,
            idx: self.next_idx,
            crc: 0,
            size: self.microslice_size,
            offset,
        });
        self.next_idx += 1;
        true
    }
}

impl TimesliceSource for SyntheticSource {
    fn desc_buffer(&self) -> &ManagedRingBuffer<MicrosliceDescriptor> {
        &self.desc
    }

    fn data_buffer(&self) -> &ManagedRingBuffer<u8> {
        &self.data
    }

    fn set_desc_read_index(&mut self, index: u64) {
        self.desc.set_read_index(index);
    }

    fn set_data_read_index(&mut self, index: u64) {
        self.data.set_read_index(index);
    }

    fn proceed(&mut self) {
        while self.generate_one() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_produces_up_to_its_limit() {
        let mut src = SyntheticSource::new(8, 16, 8, Some(4));
        src.proceed();
        assert_eq!(src.desc_buffer().write_index(), 4);
        assert_eq!(src.data_buffer().write_index(), 32);
        // calling again after the limit is a no-op
        src.proceed();
        assert_eq!(src.desc_buffer().write_index(), 4);
    }

    #[test]
    fn synthetic_source_stops_when_rings_fill() {
        // desc ring only fits 2 items regardless of the requested limit
        let mut src = SyntheticSource::new(1, 16, 8, Some(100));
        src.proceed();
        assert_eq!(src.desc_buffer().write_index(), 2);
    }
}
