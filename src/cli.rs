use clap::Parser;
use std::net::IpAddr;

use crate::probe::MAX_PAYLOAD_SIZE;

/// Send ICMP Echo Requests to many targets in parallel and report
/// per-target reachability and latency
#[derive(Parser, Debug, Clone)]
#[command(name = "reach")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target hosts (addresses or names); with -g, a CIDR prefix or a
    /// start/end address pair
    pub targets: Vec<String>,

    /// Only probe IPv4 targets
    #[arg(short = '4', long = "ipv4", conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Only probe IPv6 targets
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// Show targets that are alive
    #[arg(short = 'a', long = "alive", conflicts_with = "unreach")]
    pub alive: bool,

    /// Show targets by address
    #[arg(short = 'A', long = "addr")]
    pub addr: bool,

    /// Amount of ping data to send, in bytes (default: 56)
    #[arg(short = 'b', long = "size")]
    pub size: Option<usize>,

    /// Exponential backoff factor (default: 1.5)
    #[arg(short = 'B', long = "backoff")]
    pub backoff: Option<f64>,

    /// Count mode: send N pings to each target and report stats
    #[arg(short = 'c', long = "count", conflicts_with = "loop_mode")]
    pub count: Option<u32>,

    /// Same as -c, but report every probe's RTT instead of aggregates
    #[arg(
        short = 'C',
        long = "vcount",
        conflicts_with_all = ["count", "loop_mode"]
    )]
    pub vcount: Option<u32>,

    /// Show targets by name (force reverse-DNS lookups)
    #[arg(short = 'd', long = "rdns", conflicts_with = "name")]
    pub rdns: bool,

    /// Print a timestamp before each output line
    #[arg(short = 'D', long = "timestamp")]
    pub timestamp: bool,

    /// Timestamp format (-D required): ctime, iso, or rfc3339
    #[arg(long = "timestamp-format", requires = "timestamp")]
    pub timestamp_format: Option<String>,

    /// Show elapsed time on return packets
    #[arg(short = 'e', long = "elapsed")]
    pub elapsed: bool,

    /// Read the target list from a file (- means stdin)
    #[arg(short = 'f', long = "file", conflicts_with = "generate")]
    pub file: Option<String>,

    /// Generate the target list from the given CIDR prefix or start/end
    /// address pair
    #[arg(short = 'g', long = "generate")]
    pub generate: bool,

    /// Set the IP TTL (hops) on outgoing packets
    #[arg(short = 'H', long = "ttl")]
    pub ttl: Option<u32>,

    /// Interval between any two sends, in milliseconds (default: 10)
    #[arg(short = 'i', long = "interval", default_value_t = 10.0)]
    pub interval: f64,

    /// Bind probes to a network interface
    #[arg(short = 'I', long = "iface")]
    pub iface: Option<String>,

    /// Set the routing mark on outgoing packets
    #[arg(short = 'k', long = "fwmark")]
    pub fwmark: Option<u32>,

    /// Loop mode: probe targets until interrupted
    #[arg(short = 'l', long = "loop")]
    pub loop_mode: bool,

    /// Probe all addresses of multi-homed targets
    #[arg(short = 'm', long = "all")]
    pub all: bool,

    /// Set the Don't Fragment flag
    #[arg(short = 'M', long = "dontfrag")]
    pub dontfrag: bool,

    /// Show targets by name (reverse-DNS lookup of numeric targets)
    #[arg(short = 'n', long = "name")]
    pub name: bool,

    /// Show accumulated outage time (lost packets x period)
    #[arg(short = 'o', long = "outage")]
    pub outage: bool,

    /// Set the type of service on outgoing packets
    #[arg(short = 'O', long = "tos")]
    pub tos: Option<u32>,

    /// Interval between probes to one target, in milliseconds
    /// (count and loop modes, default: 1000)
    #[arg(short = 'p', long = "period", default_value_t = 1000.0)]
    pub period: f64,

    /// Quiet: no per-probe output
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Same as -q, plus an interval summary every SECS seconds; append
    /// ",cumulative" to keep stats accumulating across intervals
    #[arg(short = 'Q', long = "squiet", value_name = "SECS[,cumulative]")]
    pub squiet: Option<String>,

    /// Number of retries in default mode (default: 3)
    #[arg(short = 'r', long = "retry", default_value_t = 3)]
    pub retry: u32,

    /// Random packet payload (to foil link data compression)
    #[arg(short = 'R', long = "random")]
    pub random: bool,

    /// Print final statistics
    #[arg(short = 's', long = "stats")]
    pub stats: bool,

    /// Set the source address
    #[arg(short = 'S', long = "src")]
    pub src: Option<IpAddr>,

    /// Initial per-target timeout in milliseconds (default: 500, except
    /// with -l/-c/-C where it is the -p period up to 2000)
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<f64>,

    /// Show targets that are unreachable
    #[arg(short = 'u', long = "unreach")]
    pub unreach: bool,

    /// Exit with success if at least N hosts are reachable
    #[arg(short = 'x', long = "reachable", conflicts_with = "fast_reachable")]
    pub reachable: Option<usize>,

    /// Like -x, but exit as soon as N hosts have answered
    #[arg(short = 'X', long = "fast-reachable")]
    pub fast_reachable: Option<usize>,

    /// Discard replies whose source is not the target address
    #[arg(long = "check-source")]
    pub check_source: bool,

    /// Send ICMP Timestamp Requests instead of Echo Requests (IPv4 only)
    #[arg(long = "icmp-timestamp")]
    pub icmp_timestamp: bool,

    /// Show the received TOS value
    #[arg(long = "print-tos")]
    pub print_tos: bool,

    /// Show the received IP TTL value
    #[arg(long = "print-ttl")]
    pub print_ttl: bool,
}

impl Args {
    /// Cross-flag checks clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(size) = self.size {
            if self.icmp_timestamp {
                return Err("cannot change ICMP Timestamp size".into());
            }
            if size > MAX_PAYLOAD_SIZE {
                return Err(format!(
                    "data size {} not valid, must not be larger than {}",
                    size, MAX_PAYLOAD_SIZE
                ));
            }
        }

        if self.icmp_timestamp && self.ipv6 {
            return Err("ICMP Timestamp probing is IPv4 only".into());
        }

        if let Some(backoff) = self.backoff
            && !(1.0..=5.0).contains(&backoff)
        {
            return Err(format!(
                "backoff factor {:.1} not valid, must be between 1.0 and 5.0",
                backoff
            ));
        }

        if matches!(self.count.or(self.vcount), Some(0)) {
            return Err("count must be at least 1".into());
        }

        if self.interval < 0.0 || self.period < 0.0 {
            return Err("interval and period must not be negative".into());
        }

        if let Some(timeout) = self.timeout
            && timeout <= 0.0
        {
            return Err("timeout must be positive".into());
        }

        if let Some(ref spec) = self.squiet
            && parse_squiet(spec).is_none()
        {
            return Err(format!("bad report interval: {}", spec));
        }

        if let Some(ref format) = self.timestamp_format
            && !["ctime", "iso", "rfc3339"].contains(&format.as_str())
        {
            return Err(format!(
                "unknown timestamp format: {} (use ctime, iso, or rfc3339)",
                format
            ));
        }

        if matches!(self.reachable.or(self.fast_reachable), Some(0)) {
            return Err("reachable threshold must be at least 1".into());
        }

        if self.generate && self.targets.is_empty() {
            return Err("--generate needs a CIDR prefix or a start/end pair".into());
        }

        if self.file.is_some() && !self.targets.is_empty() {
            return Err("specify either a target file or targets, not both".into());
        }

        Ok(())
    }
}

/// `SECS[,cumulative]` -> (report interval in ns, cumulative flag)
pub fn parse_squiet(spec: &str) -> Option<(i64, bool)> {
    let (secs_str, cumulative) = match spec.split_once(',') {
        Some((s, "cumulative")) => (s, true),
        // trailing keywords other than "cumulative" are ignored
        Some((s, _)) => (s, false),
        None => (spec, false),
    };
    let secs: f64 = secs_str.parse().ok()?;
    if secs < 0.0 {
        return None;
    }
    Some(((secs * 1e9) as i64, cumulative))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("reach").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let a = args(&["127.0.0.1"]);
        assert_eq!(a.interval, 10.0);
        assert_eq!(a.period, 1000.0);
        assert_eq!(a.retry, 3);
        assert_eq!(a.timeout, None);
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_count_loop_exclusive() {
        assert!(
            Args::try_parse_from(["reach", "-c", "5", "-l", "127.0.0.1"]).is_err()
        );
    }

    #[test]
    fn test_alive_unreach_exclusive() {
        assert!(Args::try_parse_from(["reach", "-a", "-u", "127.0.0.1"]).is_err());
    }

    #[test]
    fn test_backoff_bounds() {
        assert!(args(&["-B", "0.5", "h"]).validate().is_err());
        assert!(args(&["-B", "6", "h"]).validate().is_err());
        assert!(args(&["-B", "2.0", "h"]).validate().is_ok());
    }

    #[test]
    fn test_size_bounds() {
        assert!(args(&["-b", "65508", "h"]).validate().is_err());
        assert!(args(&["-b", "65507", "h"]).validate().is_ok());
        assert!(args(&["-b", "100", "--icmp-timestamp", "h"]).validate().is_err());
    }

    #[test]
    fn test_squiet_parsing() {
        assert_eq!(parse_squiet("5"), Some((5_000_000_000, false)));
        assert_eq!(parse_squiet("0.5"), Some((500_000_000, false)));
        assert_eq!(parse_squiet("10,cumulative"), Some((10_000_000_000, true)));
        assert_eq!(parse_squiet("10,bogus"), Some((10_000_000_000, false)));
        assert_eq!(parse_squiet("abc"), None);
        assert_eq!(parse_squiet("-1"), None);
    }

    #[test]
    fn test_timestamp_format_requires_timestamp() {
        assert!(
            Args::try_parse_from(["reach", "--timestamp-format", "iso", "h"]).is_err()
        );
        assert!(
            args(&["-D", "--timestamp-format", "iso", "h"]).validate().is_ok()
        );
        assert!(
            args(&["-D", "--timestamp-format", "nope", "h"]).validate().is_err()
        );
    }

    #[test]
    fn test_icmp_timestamp_v4_only() {
        assert!(args(&["--icmp-timestamp", "-6", "h"]).validate().is_err());
        assert!(args(&["--icmp-timestamp", "h"]).validate().is_ok());
    }
}
