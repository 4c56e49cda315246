use pnet::packet::ipv4::Ipv4Packet;
use std::fmt;

use crate::probe::icmp::{ICMP_HEADER_SIZE, RequestKind, TIMESTAMP_PAYLOAD_SIZE};

// IP protocol numbers
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

// ICMPv4 error types carrying the offending datagram
const ICMP_UNREACH: u8 = 3;
const ICMP_SOURCE_QUENCH: u8 = 4;
const ICMP_REDIRECT: u8 = 5;
const ICMP_TIME_EXCEEDED: u8 = 11;
const ICMP_PARAM_PROBLEM: u8 = 12;

// ICMPv6 error types
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_PACKET_TOO_BIG: u8 = 2;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_PARAM_PROBLEM: u8 = 4;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Timestamps from an ICMP Timestamp Reply, milliseconds since midnight UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampFields {
    pub originate: u32,
    pub receive: u32,
    pub transmit: u32,
}

/// ICMP error flavor bound to one of our probes via the quoted datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpErrorKind {
    Unreachable(u8),
    SourceQuench,
    Redirect,
    TimeExceeded,
    ParameterProblem,
    UnreachableV6(u8),
    PacketTooBig,
    TimeExceededV6,
    ParameterProblemV6,
}

const UNREACH_STR: [&str; 16] = [
    "ICMP Network Unreachable",
    "ICMP Host Unreachable",
    "ICMP Protocol Unreachable",
    "ICMP Port Unreachable",
    "ICMP Unreachable (Fragmentation Needed)",
    "ICMP Unreachable (Source Route Failed)",
    "ICMP Unreachable (Destination Network Unknown)",
    "ICMP Unreachable (Destination Host Unknown)",
    "ICMP Unreachable (Source Host Isolated)",
    "ICMP Unreachable (Communication with Network Prohibited)",
    "ICMP Unreachable (Communication with Host Prohibited)",
    "ICMP Unreachable (Network Unreachable For Type Of Service)",
    "ICMP Unreachable (Host Unreachable For Type Of Service)",
    "ICMP Unreachable (Communication Administratively Prohibited)",
    "ICMP Unreachable (Host Precedence Violation)",
    "ICMP Unreachable (Precedence cutoff in effect)",
];

impl fmt::Display for IcmpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpErrorKind::Unreachable(code) => match UNREACH_STR.get(*code as usize) {
                Some(s) => f.write_str(s),
                None => f.write_str("ICMP Unreachable (Invalid Code)"),
            },
            IcmpErrorKind::SourceQuench => f.write_str("ICMP Source Quench"),
            IcmpErrorKind::Redirect => f.write_str("ICMP Redirect"),
            IcmpErrorKind::TimeExceeded => f.write_str("ICMP Time Exceeded"),
            IcmpErrorKind::ParameterProblem => f.write_str("ICMP Parameter Problem"),
            IcmpErrorKind::UnreachableV6(_) => f.write_str("ICMPv6 Destination Unreachable"),
            IcmpErrorKind::PacketTooBig => f.write_str("ICMPv6 Packet Too Big"),
            IcmpErrorKind::TimeExceededV6 => f.write_str("ICMPv6 Time Exceeded"),
            IcmpErrorKind::ParameterProblemV6 => f.write_str("ICMPv6 Parameter Problem"),
        }
    }
}

/// Why a datagram was not a usable reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Shorter than the minimum for its classification (worth a verbose log)
    TooShort(usize),
    /// Expected reply type but the id is not ours
    WrongId,
    /// Error message whose quoted datagram is not one of ours
    NotOurs,
    /// ICMP type we neither expect nor classify
    UnknownType,
    /// Reply checksum does not verify
    BadChecksum,
}

/// Result of decoding one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// The reply we asked for, carrying our id.
    Reply {
        seq: u16,
        /// TTL from the IP header (raw IPv4 sockets only)
        ttl: Option<u8>,
        /// TOS from the IP header (raw IPv4 sockets only)
        tos: Option<u8>,
        /// Length of the ICMP message, IP header excluded
        icmp_len: usize,
        /// Present for Timestamp Replies
        timestamps: Option<TimestampFields>,
    },
    /// An ICMP error quoting one of our requests; `seq` is the original
    /// probe's sequence number.
    OtherIcmp { seq: u16, kind: IcmpErrorKind },
    Discard(DiscardReason),
}

/// ICMP checksum verification (RFC 1071): the one's-complement sum over
/// the message, checksum field included, must fold to all-ones.
fn validate_icmp_checksum(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum == 0xFFFF || sum == 0x0000
}

/// Decode an IPv4 datagram.
///
/// Raw sockets deliver the IP header (`strip_ip_header`); DGRAM ICMP
/// sockets hand over the bare ICMP message.
pub fn decode_v4(data: &[u8], kind: RequestKind, ident: u16, strip_ip_header: bool) -> Decoded {
    let (hlen, ttl, tos) = if strip_ip_header {
        if data.is_empty() {
            return Decoded::Discard(DiscardReason::TooShort(data.len()));
        }
        let hlen = ((data[0] & 0x0F) as usize) * 4;
        if hlen < IPV4_MIN_HEADER || data.len() < hlen {
            return Decoded::Discard(DiscardReason::TooShort(data.len()));
        }
        (hlen, Some(data[8]), Some(data[1]))
    } else {
        (0, None, None)
    };

    if data.len() < hlen + ICMP_HEADER_SIZE {
        return Decoded::Discard(DiscardReason::TooShort(data.len()));
    }

    let icmp = &data[hlen..];
    let icmp_type = icmp[0];

    if icmp_type == kind.reply_type(false) {
        if !validate_icmp_checksum(icmp) {
            return Decoded::Discard(DiscardReason::BadChecksum);
        }

        let id = u16::from_be_bytes([icmp[4], icmp[5]]);
        if id != ident {
            return Decoded::Discard(DiscardReason::WrongId);
        }
        let seq = u16::from_be_bytes([icmp[6], icmp[7]]);

        let timestamps = if kind == RequestKind::Timestamp {
            if icmp.len() < ICMP_HEADER_SIZE + TIMESTAMP_PAYLOAD_SIZE {
                return Decoded::Discard(DiscardReason::TooShort(data.len()));
            }
            Some(TimestampFields {
                originate: u32::from_be_bytes(icmp[8..12].try_into().unwrap()),
                receive: u32::from_be_bytes(icmp[12..16].try_into().unwrap()),
                transmit: u32::from_be_bytes(icmp[16..20].try_into().unwrap()),
            })
        } else {
            None
        };

        return Decoded::Reply {
            seq,
            ttl,
            tos,
            icmp_len: icmp.len(),
            timestamps,
        };
    }

    let error_kind = match icmp_type {
        ICMP_UNREACH => IcmpErrorKind::Unreachable(icmp[1]),
        ICMP_SOURCE_QUENCH => IcmpErrorKind::SourceQuench,
        ICMP_REDIRECT => IcmpErrorKind::Redirect,
        ICMP_TIME_EXCEEDED => IcmpErrorKind::TimeExceeded,
        ICMP_PARAM_PROBLEM => IcmpErrorKind::ParameterProblem,
        _ => return Decoded::Discard(DiscardReason::UnknownType),
    };

    // Error messages quote the original IP header plus at least the first
    // 8 bytes of our ICMP message. Anything shorter cannot be tied to a
    // probe and is dropped.
    if icmp.len() < ICMP_HEADER_SIZE + IPV4_MIN_HEADER + ICMP_HEADER_SIZE {
        return Decoded::Discard(DiscardReason::NotOurs);
    }

    let quoted = &icmp[ICMP_HEADER_SIZE..];
    let Some(orig_ip) = Ipv4Packet::new(quoted) else {
        return Decoded::Discard(DiscardReason::NotOurs);
    };
    let orig_hlen = (orig_ip.get_header_length() as usize) * 4;
    if orig_ip.get_next_level_protocol().0 != IPPROTO_ICMP
        || quoted.len() < orig_hlen + ICMP_HEADER_SIZE
    {
        return Decoded::Discard(DiscardReason::NotOurs);
    }

    let orig_icmp = &quoted[orig_hlen..];
    let orig_id = u16::from_be_bytes([orig_icmp[4], orig_icmp[5]]);
    if orig_icmp[0] != kind.request_type(false) || orig_id != ident {
        return Decoded::Discard(DiscardReason::NotOurs);
    }

    Decoded::OtherIcmp {
        seq: u16::from_be_bytes([orig_icmp[6], orig_icmp[7]]),
        kind: error_kind,
    }
}

/// Decode an ICMPv6 datagram. The kernel strips the IPv6 header before
/// delivery, for raw and DGRAM sockets alike, and verifies the checksum.
pub fn decode_v6(data: &[u8], ident: u16) -> Decoded {
    if data.len() < ICMP_HEADER_SIZE {
        return Decoded::Discard(DiscardReason::TooShort(data.len()));
    }

    let icmp_type = data[0];

    if icmp_type == RequestKind::Echo.reply_type(true) {
        let id = u16::from_be_bytes([data[4], data[5]]);
        if id != ident {
            return Decoded::Discard(DiscardReason::WrongId);
        }
        return Decoded::Reply {
            seq: u16::from_be_bytes([data[6], data[7]]),
            ttl: None,
            tos: None,
            icmp_len: data.len(),
            timestamps: None,
        };
    }

    let error_kind = match icmp_type {
        ICMPV6_DEST_UNREACHABLE => IcmpErrorKind::UnreachableV6(data[1]),
        ICMPV6_PACKET_TOO_BIG => IcmpErrorKind::PacketTooBig,
        ICMPV6_TIME_EXCEEDED => IcmpErrorKind::TimeExceededV6,
        ICMPV6_PARAM_PROBLEM => IcmpErrorKind::ParameterProblemV6,
        _ => return Decoded::Discard(DiscardReason::UnknownType),
    };

    // Quoted original: full IPv6 header, then our ICMPv6 message. This
    // path is diagnostic only; it never invalidates probe state.
    if data.len() < ICMP_HEADER_SIZE + IPV6_HEADER_LEN + ICMP_HEADER_SIZE {
        return Decoded::Discard(DiscardReason::NotOurs);
    }

    let quoted_ip = &data[ICMP_HEADER_SIZE..];
    if quoted_ip[6] != IPPROTO_ICMPV6 {
        return Decoded::Discard(DiscardReason::NotOurs);
    }

    let orig_icmp = &quoted_ip[IPV6_HEADER_LEN..];
    let orig_id = u16::from_be_bytes([orig_icmp[4], orig_icmp[5]]);
    if orig_icmp[0] != RequestKind::Echo.request_type(true) || orig_id != ident {
        return Decoded::Discard(DiscardReason::NotOurs);
    }

    Decoded::OtherIcmp {
        seq: u16::from_be_bytes([orig_icmp[6], orig_icmp[7]]),
        kind: error_kind,
    }
}
