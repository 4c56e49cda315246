//! Runtime configuration derived from CLI args.
//!
//! This is where the flag-interaction rules live: which switches imply or
//! cancel each other, the count/loop timeout auto-tuning, and the split of
//! one argument set into engine, socket, and display options.

use crate::cli::{Args, parse_squiet};
use crate::engine::{EngineConfig, Mode};
use crate::probe::{DEFAULT_PAYLOAD_SIZE, RequestKind, SocketConfig, TIMESTAMP_PAYLOAD_SIZE};
use crate::report::{DisplayOptions, TimestampFormat};
use crate::target::{FamilyFilter, NamingOptions};

/// In count/loop mode an unset timeout follows the period, capped here.
const AUTOTUNE_TIMEOUT_MAX_NS: i64 = 2_000_000_000;

fn ms_to_ns(ms: f64) -> i64 {
    (ms * 1e6) as i64
}

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub display: DisplayOptions,
    pub socket: SocketConfig,
    pub iface: Option<String>,
    pub family: FamilyFilter,
    pub naming: NamingOptions,
    pub all_addrs: bool,
    pub file: Option<String>,
    pub generate: bool,
    pub quiet: bool,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        let mode = if args.loop_mode {
            Mode::Loop
        } else if let Some(count) = args.count.or(args.vcount) {
            Mode::Count(count)
        } else {
            Mode::Default
        };

        let period_ns = ms_to_ns(args.period);
        let timeout_ns = match args.timeout {
            Some(ms) => ms_to_ns(ms),
            // Auto-tune: in count/loop the deadline follows the cadence,
            // so slow targets are not reported lost at high periods
            None if mode != Mode::Default => period_ns.min(AUTOTUNE_TIMEOUT_MAX_NS),
            None => 500_000_000,
        };

        let (report_interval_ns, cumulative_stats) = args
            .squiet
            .as_deref()
            .and_then(parse_squiet)
            .unwrap_or((0, false));

        let request = if args.icmp_timestamp {
            RequestKind::Timestamp
        } else {
            RequestKind::Echo
        };

        let min_reachable = args.reachable.or(args.fast_reachable).unwrap_or(0);

        // Output switches: default mode is verbose; -q/-Q clear it, count
        // and loop modes replace it with per-probe lines or summaries.
        let quiet = args.quiet || args.squiet.is_some();
        let mut verbose = !quiet;
        let mut per_probe = false;
        let mut show_alive = args.alive;
        let mut show_unreachable = args.unreach;

        match mode {
            Mode::Count(_) => {
                if verbose {
                    per_probe = true;
                }
                show_alive = false;
                show_unreachable = false;
                verbose = false;
            }
            Mode::Loop => {
                if report_interval_ns == 0 {
                    per_probe = true;
                }
                show_alive = false;
                show_unreachable = false;
                verbose = false;
            }
            Mode::Default => {}
        }

        if show_alive || show_unreachable || min_reachable > 0 {
            verbose = false;
        }

        let timestamp_format = match args.timestamp_format.as_deref() {
            Some("ctime") => TimestampFormat::Ctime,
            Some("iso") => TimestampFormat::Iso,
            Some("rfc3339") => TimestampFormat::Rfc3339,
            _ => TimestampFormat::Epoch,
        };

        let payload_size = if args.icmp_timestamp {
            TIMESTAMP_PAYLOAD_SIZE
        } else {
            args.size.unwrap_or(DEFAULT_PAYLOAD_SIZE)
        };

        let engine = EngineConfig {
            mode,
            interval_ns: ms_to_ns(args.interval),
            period_ns,
            initial_timeout_ns: timeout_ns,
            retries: args.retry,
            backoff_factor: args.backoff.unwrap_or(1.5),
            // loop mode never retries, so backoff does not apply there
            backoff_enabled: !args.loop_mode,
            payload_size,
            random_payload: args.random,
            request,
            check_source: args.check_source,
            report_interval_ns,
            cumulative_stats,
            min_reachable,
            fast_reachable: args.fast_reachable.is_some(),
            verbose,
        };

        let display = DisplayOptions {
            verbose,
            quiet,
            show_alive,
            show_unreachable,
            per_probe,
            report_all_rtts: args.vcount.is_some(),
            elapsed: args.elapsed,
            timestamp: args.timestamp,
            timestamp_format,
            print_tos: args.print_tos,
            print_ttl: args.print_ttl,
            outage: args.outage,
            final_stats: args.stats,
            per_host_summary: mode != Mode::Default,
            icmp_timestamp: args.icmp_timestamp,
            period_ns,
            min_reachable,
            name_width: 0, // known once the host table is built
        };

        let socket = SocketConfig {
            ttl: args.ttl,
            tos: args.tos,
            dont_fragment: args.dontfrag,
            fwmark: args.fwmark,
            src_addr: args.src,
        };

        let family = if args.ipv4 || args.icmp_timestamp {
            FamilyFilter::V4
        } else if args.ipv6 {
            FamilyFilter::V6
        } else {
            FamilyFilter::Any
        };

        let naming = NamingOptions {
            by_addr: args.addr,
            lookup_numeric: args.name,
            force_rdns: args.rdns,
        };

        Self {
            engine,
            display,
            socket,
            iface: args.iface.clone(),
            family,
            naming,
            all_addrs: args.all,
            file: args.file.clone(),
            generate: args.generate,
            quiet,
        }
    }
}
