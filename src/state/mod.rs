pub mod host;

pub use host::{Counters, HostEntry, RespTime};
