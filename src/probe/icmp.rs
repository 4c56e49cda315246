use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpType, checksum};
use rand::RngCore;

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Default payload size (standard ping)
pub const DEFAULT_PAYLOAD_SIZE: usize = 56;
/// Largest payload that fits a maximal IPv4 packet (65535 - 20 - 8)
pub const MAX_PAYLOAD_SIZE: usize = 65507;
/// ICMP Timestamp messages carry exactly three 32-bit timestamps
pub const TIMESTAMP_PAYLOAD_SIZE: usize = 12;
/// Payload bytes needed to embed the send timestamp
pub const SEND_TIME_BYTES: usize = 8;

/// Request flavor put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// ICMP Echo Request (type 8, or 128 for ICMPv6)
    Echo,
    /// ICMP Timestamp Request (type 13, IPv4 only)
    Timestamp,
}

impl RequestKind {
    /// Type value of the request as sent for this address family.
    pub fn request_type(&self, ipv6: bool) -> u8 {
        match (self, ipv6) {
            (RequestKind::Echo, false) => 8,
            (RequestKind::Echo, true) => 128,
            (RequestKind::Timestamp, _) => 13,
        }
    }

    /// Type value of the expected reply for this address family.
    pub fn reply_type(&self, ipv6: bool) -> u8 {
        match (self, ipv6) {
            (RequestKind::Echo, false) => 0,
            (RequestKind::Echo, true) => 129,
            (RequestKind::Timestamp, _) => 14,
        }
    }
}

/// Process identifier carried in the ICMP id field
pub fn get_identifier() -> u16 {
    std::process::id() as u16
}

/// ICMP Timestamp fields are milliseconds since midnight UTC.
pub fn ms_since_midnight_utc(time_ns: i64) -> u32 {
    ((time_ns / 1_000_000) % (24 * 60 * 60 * 1000)) as u32
}

/// Build an ICMP Echo Request.
///
/// The first 8 payload bytes carry the big-endian send timestamp when the
/// payload is large enough; the remainder is zero, or pseudo-random when
/// `random_payload` is set. For ICMPv6 the checksum field stays zero: the
/// kernel computes it on ICMPv6 sockets (it needs the pseudo-header).
pub fn echo_request(
    ident: u16,
    seq: u16,
    payload_size: usize,
    random_payload: bool,
    send_time_ns: i64,
    ipv6: bool,
) -> Vec<u8> {
    let payload_size = payload_size.min(MAX_PAYLOAD_SIZE);
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload_size];

    let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
    packet.set_icmp_type(IcmpType::new(RequestKind::Echo.request_type(ipv6)));
    packet.set_icmp_code(IcmpCode::new(0));
    packet.set_identifier(ident);
    packet.set_sequence_number(seq);

    let payload = packet.payload_mut();
    if random_payload {
        rand::thread_rng().fill_bytes(payload);
    }
    if payload.len() >= SEND_TIME_BYTES {
        payload[..SEND_TIME_BYTES].copy_from_slice(&send_time_ns.to_be_bytes());
    }

    if !ipv6 {
        let cksum = checksum(&IcmpPacket::new(&buffer).unwrap());
        let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
        packet.set_checksum(cksum);
    }

    buffer
}

/// Build an ICMP Timestamp Request (IPv4 only, fixed 12-byte payload).
///
/// Only the originate field is filled; receive and transmit are set by the
/// responder.
pub fn timestamp_request(ident: u16, seq: u16, originate_ms: u32) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + TIMESTAMP_PAYLOAD_SIZE];

    buffer[0] = RequestKind::Timestamp.request_type(false);
    buffer[4..6].copy_from_slice(&ident.to_be_bytes());
    buffer[6..8].copy_from_slice(&seq.to_be_bytes());
    buffer[8..12].copy_from_slice(&originate_ms.to_be_bytes());

    let cksum = checksum(&IcmpPacket::new(&buffer).unwrap());
    buffer[2..4].copy_from_slice(&cksum.to_be_bytes());

    buffer
}
