pub mod decode;
pub mod icmp;
pub mod socket;

pub use decode::{Decoded, DiscardReason, IcmpErrorKind, TimestampFields, decode_v4, decode_v6};
pub use icmp::{
    DEFAULT_PAYLOAD_SIZE, ICMP_HEADER_SIZE, MAX_PAYLOAD_SIZE, RequestKind, TIMESTAMP_PAYLOAD_SIZE,
    echo_request, get_identifier, ms_since_midnight_utc, timestamp_request,
};
pub use socket::{Datagram, SocketConfig, SocketMux, Transport};
