//! Types shared between the kernel packet programs and the userspace agent.
//!
//! The structures here must be repr(C) and stay bit-compatible with the
//! layout the kernel side emits into the `packets` perf map. The crate is
//! `no_std` so the same definitions can back an eBPF build.

#![no_std]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Packet direction flags (`PacketSample::flags`).
pub const FLAG_IN: u16 = 1 << 0;
pub const FLAG_OUT: u16 = 1 << 1;

/// Packet protocols (`PacketSample::proto`).
pub const PROTO_UDP: u16 = 1;
pub const PROTO_TCP: u16 = 2;

/// Wire size of a packet sample.
pub const SAMPLE_SIZE: usize = core::mem::size_of::<PacketSample>();

/// A single per-packet event emitted by the cgroup skb programs.
///
/// Field order and widths mirror the kernel emitter's `pkt_entry`; each ring
/// record carries one of these in its leading 56 bytes, little-endian host
/// layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PacketSample {
    /// Monotonic timestamp in nanoseconds.
    pub timestamp: u64,
    /// Source IP, 16 bytes, IPv4-mapped when v4.
    pub src_ip: [u8; 16],
    /// Destination IP, 16 bytes, IPv4-mapped when v4.
    pub dest_ip: [u8; 16],
    pub src_port: u16,
    pub dest_port: u16,
    /// Bytes transferred.
    pub len: u32,
    /// Round-trip time in nanoseconds, 0 when unknown.
    pub rtt: u32,
    /// One of `PROTO_UDP` / `PROTO_TCP`.
    pub proto: u16,
    /// Direction bitset of `FLAG_IN` / `FLAG_OUT`.
    pub flags: u16,
}

impl PacketSample {
    /// Whether exactly one direction flag is set.
    pub fn has_valid_direction(&self) -> bool {
        let dir = self.flags & (FLAG_IN | FLAG_OUT);
        dir == FLAG_IN || dir == FLAG_OUT
    }
}

const _: () = assert!(SAMPLE_SIZE == 56);

#[cfg(feature = "user")]
mod user_impls {
    unsafe impl aya::Pod for super::PacketSample {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn sample() -> PacketSample {
        PacketSample {
            timestamp: 1_234_567_890,
            src_ip: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 10, 0, 0, 2],
            dest_ip: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 10, 0, 0, 1],
            src_port: 53124,
            dest_port: 443,
            len: 1500,
            rtt: 2_000_000,
            proto: PROTO_TCP,
            flags: FLAG_IN,
        }
    }

    #[test]
    fn wire_size_is_56_bytes() {
        assert_eq!(SAMPLE_SIZE, 56);
        assert_eq!(sample().as_bytes().len(), 56);
    }

    #[test]
    fn encode_decode_round_trip() {
        let orig = sample();
        let bytes = orig.as_bytes();
        let decoded = PacketSample::read_from_bytes(bytes).unwrap();
        assert_eq!(decoded, orig);
    }

    #[test]
    fn field_offsets_match_wire_layout() {
        let s = sample();
        let bytes = s.as_bytes();
        assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), s.timestamp);
        assert_eq!(&bytes[8..24], &s.src_ip);
        assert_eq!(&bytes[24..40], &s.dest_ip);
        assert_eq!(u16::from_le_bytes(bytes[40..42].try_into().unwrap()), s.src_port);
        assert_eq!(u16::from_le_bytes(bytes[42..44].try_into().unwrap()), s.dest_port);
        assert_eq!(u32::from_le_bytes(bytes[44..48].try_into().unwrap()), s.len);
        assert_eq!(u32::from_le_bytes(bytes[48..52].try_into().unwrap()), s.rtt);
        assert_eq!(u16::from_le_bytes(bytes[52..54].try_into().unwrap()), s.proto);
        assert_eq!(u16::from_le_bytes(bytes[54..56].try_into().unwrap()), s.flags);
    }

    #[test]
    fn direction_validity() {
        let mut s = sample();
        s.flags = FLAG_IN;
        assert!(s.has_valid_direction());
        s.flags = FLAG_OUT;
        assert!(s.has_valid_direction());
        s.flags = FLAG_IN | FLAG_OUT;
        assert!(!s.has_valid_direction());
        s.flags = 0;
        assert!(!s.has_valid_direction());
    }
}
