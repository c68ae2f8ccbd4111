use core::mem::offset_of;

use network_types::{
    eth::EthHdr,
    ip::{IpProto, Ipv4Hdr},
    udp::UdpHdr,
};

use crate::payload::{TimingPayloadMut, TimingRecord, PAYLOAD_LEN};

/// IPv4 EtherType in host order. The wire field is big-endian.
pub const ETH_P_IP: u16 = 0x0800;
pub const IPPROTO_UDP: u8 = IpProto::Udp as u8;

/// Ethernet + minimal IPv4 (no options) + UDP.
pub const HEADER_STACK_LEN: usize = EthHdr::LEN + Ipv4Hdr::LEN + UdpHdr::LEN;
/// Shortest frame that can carry a timing payload.
pub const MIN_FRAME_LEN: usize = HEADER_STACK_LEN + PAYLOAD_LEN;

const ETHER_TYPE_AT: usize = offset_of!(EthHdr, ether_type);
const IP_PROTO_AT: usize = EthHdr::LEN + offset_of!(Ipv4Hdr, proto);

/// Byte offset of the timing payload inside an accepted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadOffset(usize);

impl PayloadOffset {
    #[inline(always)]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Decide whether `frame` is an Ethernet/IPv4/UDP frame long enough to carry
/// a timing payload.
///
/// The length check comes first; no header byte is read from a frame shorter
/// than [`MIN_FRAME_LEN`]. Rejection is the common case (this runs on every
/// frame crossing the interface) and is not an error.
#[inline(always)]
pub fn validate(frame: &[u8]) -> Option<PayloadOffset> {
    if frame.len() < MIN_FRAME_LEN {
        return None;
    }

    let ether_type = u16::from_be_bytes([frame[ETHER_TYPE_AT], frame[ETHER_TYPE_AT + 1]]);
    if ether_type != ETH_P_IP || frame[IP_PROTO_AT] != IPPROTO_UDP {
        return None;
    }

    Some(PayloadOffset(HEADER_STACK_LEN))
}

/// Typed view over the timing payload of `frame`, if it has one.
#[inline(always)]
pub fn payload_mut(frame: &mut [u8]) -> Option<TimingPayloadMut<'_>> {
    let start = validate(frame)?.get();
    let bytes: &mut [u8; PAYLOAD_LEN] = frame.get_mut(start..start + PAYLOAD_LEN)?.try_into().ok()?;
    Some(TimingPayloadMut::new(bytes))
}

/// Read the timing payload of `frame` without modifying it.
pub fn inspect(frame: &[u8]) -> Option<TimingRecord> {
    let start = validate(frame)?.get();
    TimingRecord::decode(frame.get(start..)?)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Ethernet/IPv4/UDP frame carrying `record`, padded with `extra` bytes.
    pub fn udp_frame(record: TimingRecord, extra: usize) -> Vec<u8> {
        let mut frame = vec![0u8; MIN_FRAME_LEN + extra];

        // Ethernet: broadcast destination, locally administered source.
        frame[..6].fill(0xff);
        frame[6..12].copy_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        frame[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());

        // IPv4: version 4, IHL 5, TTL 64, UDP, 10.0.0.10 -> 10.0.0.11.
        let ip = &mut frame[EthHdr::LEN..EthHdr::LEN + Ipv4Hdr::LEN];
        let total_len = (Ipv4Hdr::LEN + UdpHdr::LEN + PAYLOAD_LEN + extra) as u16;
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[8] = 64;
        ip[9] = IPPROTO_UDP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 10]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 11]);

        // UDP: 40000 -> 2100, checksum left at zero.
        let udp_at = EthHdr::LEN + Ipv4Hdr::LEN;
        let udp_len = (UdpHdr::LEN + PAYLOAD_LEN + extra) as u16;
        frame[udp_at..udp_at + 2].copy_from_slice(&40000u16.to_be_bytes());
        frame[udp_at + 2..udp_at + 4].copy_from_slice(&2100u16.to_be_bytes());
        frame[udp_at + 4..udp_at + 6].copy_from_slice(&udp_len.to_be_bytes());

        frame[HEADER_STACK_LEN..MIN_FRAME_LEN].copy_from_slice(&record.encode());
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::udp_frame;
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_STACK_LEN, 42);
        assert_eq!(MIN_FRAME_LEN, 66);
        assert_eq!(ETHER_TYPE_AT, 12);
        assert_eq!(IP_PROTO_AT, 23);
        assert_eq!(IPPROTO_UDP, 17);
    }

    #[test]
    fn test_validate_accepts_udp_timing_frame() {
        let frame = udp_frame(TimingRecord::default(), 0);
        assert_eq!(validate(&frame), Some(PayloadOffset(HEADER_STACK_LEN)));

        let padded = udp_frame(TimingRecord::default(), 1400);
        assert_eq!(validate(&padded).map(PayloadOffset::get), Some(42));
    }

    #[test]
    fn test_validate_is_repeatable() {
        let frame = udp_frame(TimingRecord { packet_id: 7, ..Default::default() }, 3);
        let first = validate(&frame);
        let second = validate(&frame);
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    #[test]
    fn test_validate_rejects_every_short_length() {
        let frame = udp_frame(TimingRecord::default(), 0);
        for len in 0..MIN_FRAME_LEN {
            // Exact-length copy so any read past `len` would hit the end of
            // the allocation rather than trailing frame bytes.
            let short = frame[..len].to_vec().into_boxed_slice();
            assert_eq!(validate(&short), None, "len {len}");
            assert_eq!(inspect(&short), None);
        }
    }

    #[test]
    fn test_validate_rejects_other_ether_types() {
        // ARP, IPv6, VLAN, and an IPv4 EtherType written little-endian.
        for ether_type in [[0x08, 0x06], [0x86, 0xdd], [0x81, 0x00], [0x00, 0x08]] {
            let mut frame = udp_frame(TimingRecord::default(), 0);
            frame[12..14].copy_from_slice(&ether_type);
            assert_eq!(validate(&frame), None);
        }
    }

    #[test]
    fn test_validate_rejects_other_protocols() {
        for proto in [1u8, 6, 58, 132] {
            let mut frame = udp_frame(TimingRecord::default(), 0);
            frame[IP_PROTO_AT] = proto;
            assert_eq!(validate(&frame), None);
        }
    }

    #[test]
    fn test_payload_view_covers_payload_bytes_only() {
        let record = TimingRecord { packet_id: 42, ingress_ts: 5, egress_ts: 9 };
        let mut frame = udp_frame(record, 4);
        let headers = frame[..HEADER_STACK_LEN].to_vec();

        let mut payload = payload_mut(&mut frame).unwrap();
        assert_eq!(payload.packet_id(), 42);
        assert_eq!(payload.ingress_ts(), 5);
        assert_eq!(payload.egress_ts(), 9);
        payload.set_egress_ts(u64::MAX);
        assert_eq!(payload.record().egress_ts, u64::MAX);

        assert_eq!(&frame[..HEADER_STACK_LEN], &headers[..]);
        assert_eq!(&frame[MIN_FRAME_LEN - 8..MIN_FRAME_LEN], &[0xff; 8]);
        assert_eq!(&frame[MIN_FRAME_LEN..], &[0u8; 4]);
    }

    #[test]
    fn test_inspect_reads_payload() {
        let record = TimingRecord { packet_id: 42, ingress_ts: 5, egress_ts: 9 };
        let frame = udp_frame(record, 10);
        assert_eq!(inspect(&frame), Some(record));
    }
}
