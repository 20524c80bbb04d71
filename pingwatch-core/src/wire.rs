//! ICMP echo-request/reply encoding and decoding for both address families.
//!
//! Packet field manipulation goes through `pnet::packet::icmp` /
//! `pnet::packet::icmpv6`, the same crates `zzping-daemon` uses to build
//! its echo requests, generalized to carry the trace payload the
//! statistics engine needs back on reply (timestamp + target handle +
//! sequence number) instead of a fixed zero-filled payload.

use crate::error::CodecError;
use pnet::packet::icmp::{self, echo_reply, echo_request, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;

/// Opaque handle identifying a target within the registry; echoed back in
/// the trace payload so a reply can be matched to its target without a
/// linear scan over addresses.
pub type TargetHandle = u32;

/// Size in bytes of the trace payload embedded after the 8-byte ICMP
/// header: two `u32` timestamp words, a target handle, and a sequence
/// number.
pub const TRACE_PAYLOAD_LEN: usize = 16;
pub const ICMP_HEADER_LEN: usize = 8;

/// Trace payload embedded in every echo request and echoed back verbatim
/// by a conformant stack. Encoded in host byte order: it is opaque data
/// as far as the wire is concerned, only this process interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracePayload {
    pub timestamp_secs: u32,
    pub timestamp_micros: u32,
    pub target_handle: TargetHandle,
    pub seq: u32,
}

impl TracePayload {
    pub fn to_bytes(self) -> [u8; TRACE_PAYLOAD_LEN] {
        let mut buf = [0u8; TRACE_PAYLOAD_LEN];
        buf[0..4].copy_from_slice(&self.timestamp_secs.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.timestamp_micros.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.target_handle.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.seq.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != TRACE_PAYLOAD_LEN {
            return None;
        }
        Some(TracePayload {
            timestamp_secs: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
            timestamp_micros: u32::from_ne_bytes(buf[4..8].try_into().ok()?),
            target_handle: u32::from_ne_bytes(buf[8..12].try_into().ok()?),
            seq: u32::from_ne_bytes(buf[12..16].try_into().ok()?),
        })
    }
}

/// One's-complement checksum over `data`, as specified for ICMP: a 32-bit
/// accumulator over sequential 16-bit words, an odd trailing byte
/// left-justified in its own word, folded twice, then complemented.
///
/// `pnet`'s own `icmp::checksum` implements the same algorithm; this
/// standalone version exists so the wire format's defining property
/// (`checksum(packet_with_checksum_written) == 0`) can be tested without
/// depending on `pnet`'s internals, and so it can be reused for the IPv6
/// software-checksum fallback path.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Encodes an IPv4 ICMP echo-request into `buf`, which must be at least
/// `ICMP_HEADER_LEN + TRACE_PAYLOAD_LEN` bytes. Returns the number of
/// bytes written.
pub fn encode_v4(
    buf: &mut [u8],
    ident: u16,
    seq: u16,
    payload: TracePayload,
) -> Result<usize, CodecError> {
    let total = ICMP_HEADER_LEN + TRACE_PAYLOAD_LEN;
    if buf.len() < total {
        return Err(CodecError::TooShort {
            got: buf.len(),
            need: total,
        });
    }
    let mut packet =
        echo_request::MutableEchoRequestPacket::new(&mut buf[..total]).ok_or(CodecError::PacketBuild)?;
    packet.set_icmp_type(IcmpTypes::EchoRequest);
    packet.set_icmp_code(icmp::IcmpCode::new(0));
    packet.set_identifier(ident);
    packet.set_sequence_number(seq);
    packet.set_payload(&payload.to_bytes());
    packet.set_checksum(0);
    let cksum = checksum(packet.packet());
    packet.set_checksum(cksum);
    Ok(total)
}

/// Decodes an IPv4 ICMP echo-reply received on a raw `AF_INET` socket
/// (which, on Linux, delivers the IPv4 header along with the payload).
/// Returns the embedded identifier and trace payload.
pub fn decode_v4(buf: &[u8], our_ident: u16) -> Result<(u16, TracePayload), CodecError> {
    let ip = Ipv4Packet::new(buf).ok_or(CodecError::TooShort {
        got: buf.len(),
        need: 20,
    })?;
    let ihl = ip.get_header_length();
    if ihl < 5 {
        return Err(CodecError::BadIhl(ihl));
    }
    let header_bytes = (ihl as usize) * 4;
    if buf.len() < header_bytes + ICMP_HEADER_LEN {
        return Err(CodecError::TooShort {
            got: buf.len(),
            need: header_bytes + ICMP_HEADER_LEN,
        });
    }
    let icmp_bytes = ip.payload();
    let reply = echo_reply::EchoReplyPacket::new(icmp_bytes).ok_or(CodecError::TooShort {
        got: icmp_bytes.len(),
        need: ICMP_HEADER_LEN,
    })?;
    if reply.get_icmp_type() != IcmpTypes::EchoReply {
        return Err(CodecError::WrongIcmpType(reply.get_icmp_type().0));
    }
    let ident = reply.get_identifier();
    if ident != our_ident {
        return Err(CodecError::AlienIdentifier {
            got: ident,
            expected: our_ident,
        });
    }
    let trace_bytes = reply.payload();
    if trace_bytes.len() != TRACE_PAYLOAD_LEN {
        return Err(CodecError::PayloadLength {
            got: trace_bytes.len(),
            expected: TRACE_PAYLOAD_LEN,
        });
    }
    let payload = TracePayload::from_bytes(trace_bytes).ok_or(CodecError::PacketBuild)?;
    Ok((ident, payload))
}

const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Encodes an IPv6 ICMP echo-request into `buf`. The checksum field is
/// left zero: a raw ICMPv6 socket with `IPV6_CHECKSUM` configured has the
/// kernel fill it in (and the pseudo-header it depends on is not knowable
/// here without duplicating routing decisions). See `socket::IcmpSocket`.
///
/// `MutableIcmpv6Packet` has no identifier/sequence accessors (ICMPv6
/// echo fields are not part of the generic ICMPv6 header pnet models), so
/// those four bytes are written directly, mirroring the approach used by
/// `icmp-ping::icmp::Encode<Icmpv6>`.
pub fn encode_v6(
    buf: &mut [u8],
    ident: u16,
    seq: u16,
    payload: TracePayload,
) -> Result<usize, CodecError> {
    let total = ICMP_HEADER_LEN + TRACE_PAYLOAD_LEN;
    if buf.len() < total {
        return Err(CodecError::TooShort {
            got: buf.len(),
            need: total,
        });
    }
    let buf = &mut buf[..total];
    buf[0] = ICMPV6_ECHO_REQUEST;
    buf[1] = 0; // code
    buf[2] = 0; // checksum, kernel-filled
    buf[3] = 0;
    buf[4..6].copy_from_slice(&ident.to_be_bytes());
    buf[6..8].copy_from_slice(&seq.to_be_bytes());
    buf[8..].copy_from_slice(&payload.to_bytes());
    Ok(total)
}

/// Decodes an IPv6 ICMP echo-reply. Raw `AF_INET6` sockets do not deliver
/// the IPv6 header to userspace, so `buf` starts at the ICMPv6 header.
pub fn decode_v6(buf: &[u8], our_ident: u16) -> Result<(u16, TracePayload), CodecError> {
    if buf.len() < ICMP_HEADER_LEN {
        return Err(CodecError::TooShort {
            got: buf.len(),
            need: ICMP_HEADER_LEN,
        });
    }
    if buf[0] != ICMPV6_ECHO_REPLY {
        return Err(CodecError::WrongIcmpType(buf[0]));
    }
    let ident = u16::from_be_bytes([buf[4], buf[5]]);
    if ident != our_ident {
        return Err(CodecError::AlienIdentifier {
            got: ident,
            expected: our_ident,
        });
    }
    let trace_bytes = &buf[ICMP_HEADER_LEN..];
    if trace_bytes.len() != TRACE_PAYLOAD_LEN {
        return Err(CodecError::PayloadLength {
            got: trace_bytes.len(),
            expected: TRACE_PAYLOAD_LEN,
        });
    }
    let payload = TracePayload::from_bytes(trace_bytes).ok_or(CodecError::PacketBuild)?;
    Ok((ident, payload))
}

/// The on-wire ICMP sequence is the full 32-bit sequence truncated to 16
/// bits; replies whose payload `seq` does not agree with the truncated
/// wire sequence are dropped as a wraparound-aliasing guard.
pub fn wire_seq_matches(wire_seq: u16, payload_seq: u32) -> bool {
    wire_seq == (payload_seq % 65536) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trips_to_zero() {
        let payload = TracePayload {
            timestamp_secs: 123,
            timestamp_micros: 456,
            target_handle: 7,
            seq: 99,
        };
        let mut buf = [0u8; ICMP_HEADER_LEN + TRACE_PAYLOAD_LEN];
        encode_v4(&mut buf, 0x1234, 1, payload).unwrap();
        assert_eq!(checksum(&buf), 0);
    }

    #[test]
    fn checksum_handles_odd_length() {
        let data = [0x01u8, 0x02, 0x03];
        // Just assert it doesn't panic and is deterministic.
        assert_eq!(checksum(&data), checksum(&data));
    }

    #[test]
    fn encode_decode_v6_round_trip() {
        let payload = TracePayload {
            timestamp_secs: 1,
            timestamp_micros: 2,
            target_handle: 3,
            seq: 4,
        };
        let mut buf = [0u8; ICMP_HEADER_LEN + TRACE_PAYLOAD_LEN];
        encode_v6(&mut buf, 42, 4, payload).unwrap();
        // Flip to a reply as the remote stack would.
        buf[0] = ICMPV6_ECHO_REPLY;
        let (ident, decoded) = decode_v6(&buf, 42).unwrap();
        assert_eq!(ident, 42);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn decode_v6_rejects_alien_identifier() {
        let payload = TracePayload {
            timestamp_secs: 0,
            timestamp_micros: 0,
            target_handle: 0,
            seq: 0,
        };
        let mut buf = [0u8; ICMP_HEADER_LEN + TRACE_PAYLOAD_LEN];
        encode_v6(&mut buf, 42, 0, payload).unwrap();
        buf[0] = ICMPV6_ECHO_REPLY;
        assert!(matches!(
            decode_v6(&buf, 99),
            Err(CodecError::AlienIdentifier { .. })
        ));
    }

    #[test]
    fn wire_seq_wraparound() {
        assert!(wire_seq_matches(5, 65541));
        assert!(!wire_seq_matches(5, 65540));
    }
}
