//! Line-oriented output: per-probe lines, per-target summaries, interval
//! splits, and the global statistics block.
//!
//! The engine never prints; it hands every classified probe to a
//! `Reporter`. The console implementation keeps probe results on stdout
//! and statistics/warnings on stderr so either stream can be scripted
//! against in isolation.

use chrono::{DateTime, Local};
use std::net::IpAddr;

use crate::engine::GlobalStats;
use crate::probe::{IcmpErrorKind, TimestampFields, ms_since_midnight_utc};
use crate::state::{Counters, HostEntry};

/// Classification of one probe, delivered to the reporter after the host
/// statistics have been updated.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Reply {
        rtt_ns: i64,
        bytes: usize,
        from: IpAddr,
        ttl: Option<u8>,
        tos: Option<u8>,
        timestamps: Option<TimestampFields>,
        recv_time_ns: i64,
    },
    Timeout,
    SendError {
        error: String,
    },
    Duplicate {
        rtt_ns: i64,
        bytes: usize,
        from: IpAddr,
    },
    OtherIcmp {
        kind: IcmpErrorKind,
        from: IpAddr,
    },
}

pub trait Reporter {
    fn on_probe_result(&mut self, host: &HostEntry, ping_index: usize, outcome: &ProbeOutcome);

    /// Interval report is due (`-Q` period elapsed, or SIGQUIT). Interval
    /// counters are reset by the engine afterwards.
    fn on_interval_tick(&mut self, hosts: &[HostEntry], now_ns: i64);

    fn on_finish(&mut self, hosts: &[HostEntry], stats: &GlobalStats, elapsed_ns: i64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    /// `[1700000000.12345] ` seconds since the epoch
    #[default]
    Epoch,
    Ctime,
    Iso,
    Rfc3339,
}

/// Output switches, resolved from the CLI by `Config`.
#[derive(Debug, Clone, Default)]
pub struct DisplayOptions {
    pub verbose: bool,
    pub quiet: bool,
    pub show_alive: bool,
    pub show_unreachable: bool,
    /// One line per received/timed-out probe
    pub per_probe: bool,
    /// Raw RTT list in the final summary instead of aggregates
    pub report_all_rtts: bool,
    pub elapsed: bool,
    pub timestamp: bool,
    pub timestamp_format: TimestampFormat,
    pub print_tos: bool,
    pub print_ttl: bool,
    pub outage: bool,
    /// Global statistics block at exit
    pub final_stats: bool,
    /// Per-target summary at exit (count and loop modes)
    pub per_host_summary: bool,
    pub icmp_timestamp: bool,
    pub period_ns: i64,
    pub min_reachable: usize,
    /// Width of the display-name column
    pub name_width: usize,
}

pub struct ConsoleReporter {
    opts: DisplayOptions,
    num_noaddress: usize,
}

/// Render nanoseconds as milliseconds, precision stepping by magnitude.
pub fn format_rtt(ns: i64) -> String {
    let t = ns as f64 / 1e6;
    if t < 0.0 {
        format!("{:.2}", t)
    } else if t < 1.0 {
        format!("{:.3}", t)
    } else if t < 10.0 {
        format!("{:.2}", t)
    } else if t < 100.0 {
        format!("{:.1}", t)
    } else if t < 1_000_000.0 {
        format!("{:.0}", t)
    } else {
        format!("{:.3e}", t)
    }
}

fn local_time(ns: i64) -> DateTime<Local> {
    DateTime::from_timestamp(ns / 1_000_000_000, (ns % 1_000_000_000) as u32)
        .unwrap_or_default()
        .with_timezone(&Local)
}

fn timestamp_prefix(ns: i64, format: TimestampFormat) -> String {
    match format {
        TimestampFormat::Epoch => format!("[{:.5}] ", ns as f64 / 1e9),
        TimestampFormat::Ctime => format!("[{}] ", local_time(ns).format("%c")),
        TimestampFormat::Iso => format!("[{}] ", local_time(ns).format("%Y-%m-%dT%T%z")),
        TimestampFormat::Rfc3339 => format!("[{}] ", local_time(ns).format("%Y-%m-%d %H:%M:%S")),
    }
}

/// `(12.3 avg, 0% loss)` tail of a per-probe line. Falls back to the
/// `%return` form when duplicates push the receive count past the send
/// count.
fn avg_loss_tail(c: &Counters, recv_total: u64) -> String {
    let avg = match c.avg_rtt() {
        Some(ns) => format_rtt(ns),
        None => "NaN".into(),
    };
    if c.recv <= c.sent {
        format!("({} avg, {}% loss)", avg, c.loss_pct())
    } else {
        let pct = if c.sent > 0 {
            recv_total * 100 / c.sent
        } else {
            0
        };
        format!("({} avg, {}% return)", avg, pct)
    }
}

/// ` xmt/rcv/%loss = 5/5/0%, min/avg/max = 0.05/0.12/0.46` summary body.
pub fn counters_summary(c: &Counters, outage_period_ns: Option<i64>) -> String {
    let mut line = if c.recv <= c.sent {
        let mut s = format!(
            " xmt/rcv/%loss = {}/{}/{}%",
            c.sent,
            c.recv,
            c.loss_pct()
        );
        if let Some(period) = outage_period_ns {
            let outage_ms = (c.sent - c.recv) as i64 * period / 1_000_000;
            s.push_str(&format!(", outage(ms) = {}", outage_ms));
        }
        s
    } else {
        let pct = if c.sent > 0 { c.recv * 100 / c.sent } else { 0 };
        format!(" xmt/rcv/%return = {}/{}/{}%", c.sent, c.recv, pct)
    };

    if let Some(avg) = c.avg_rtt() {
        line.push_str(&format!(
            ", min/avg/max = {}/{}/{}",
            format_rtt(c.min_rtt),
            format_rtt(avg),
            format_rtt(c.max_rtt)
        ));
    }
    line
}

impl ConsoleReporter {
    pub fn new(opts: DisplayOptions, num_noaddress: usize) -> Self {
        Self {
            opts,
            num_noaddress,
        }
    }

    fn warn(&self, msg: &str) {
        if !self.opts.quiet {
            eprintln!("{}", msg);
        }
    }

    fn prefix(&self, ns: i64) -> String {
        if self.opts.timestamp {
            timestamp_prefix(ns, self.opts.timestamp_format)
        } else {
            String::new()
        }
    }

    fn reply_suffixes(
        &self,
        line: &mut String,
        host: &HostEntry,
        from: IpAddr,
        ttl: Option<u8>,
        tos: Option<u8>,
        timestamps: Option<TimestampFields>,
        recv_time_ns: i64,
    ) {
        if from != host.addr {
            line.push_str(&format!(" [<- {}]", from));
        }
        if self.opts.icmp_timestamp
            && let Some(ts) = timestamps
        {
            line.push_str(&format!(
                "{} timestamps: Originate={} Receive={} Transmit={} Localreceive={}",
                if self.opts.show_alive { "" } else { "," },
                ts.originate,
                ts.receive,
                ts.transmit,
                ms_since_midnight_utc(recv_time_ns)
            ));
        }
        if self.opts.print_tos {
            match tos {
                Some(tos) => line.push_str(&format!(" (TOS {})", tos)),
                None => line.push_str(" (TOS unknown)"),
            }
        }
        if self.opts.print_ttl {
            match ttl {
                Some(ttl) => line.push_str(&format!(" (TTL {})", ttl)),
                None => line.push_str(" (TTL unknown)"),
            }
        }
    }
}

impl Reporter for ConsoleReporter {
    fn on_probe_result(&mut self, host: &HostEntry, ping_index: usize, outcome: &ProbeOutcome) {
        let w = self.opts.name_width;
        match outcome {
            ProbeOutcome::Reply {
                rtt_ns,
                bytes,
                from,
                ttl,
                tos,
                timestamps,
                recv_time_ns,
            } => {
                let mut line = String::new();
                if host.total.recv == 1 && (self.opts.verbose || self.opts.show_alive) {
                    line.push_str(&host.display);
                    if self.opts.verbose {
                        line.push_str(" is alive");
                    }
                } else if self.opts.per_probe {
                    line.push_str(&self.prefix(*recv_time_ns));
                    line.push_str(&format!(
                        "{:<w$} : [{}], {} bytes, {} ms {}",
                        host.display,
                        ping_index,
                        bytes,
                        format_rtt(*rtt_ns),
                        avg_loss_tail(&host.total, host.recv_total),
                    ));
                } else if self.opts.icmp_timestamp && timestamps.is_some() {
                    // Timestamp values are the requested result; print them
                    // even when per-probe output is off
                    line.push_str(&format!("{:<w$} : [{}]", host.display, ping_index));
                } else {
                    return;
                }
                self.reply_suffixes(
                    &mut line,
                    host,
                    *from,
                    *ttl,
                    *tos,
                    *timestamps,
                    *recv_time_ns,
                );
                if self.opts.elapsed && !self.opts.per_probe {
                    line.push_str(&format!(" ({} ms)", format_rtt(*rtt_ns)));
                }
                println!("{}", line);
            }
            ProbeOutcome::Timeout => {
                if self.opts.per_probe {
                    let prefix = self.prefix(host.last_send_ns + host.timeout_ns);
                    println!(
                        "{}{:<w$} : [{}], timed out {}",
                        prefix,
                        host.display,
                        ping_index,
                        avg_loss_tail(&host.total, host.recv_total),
                    );
                }
            }
            ProbeOutcome::SendError { error } => {
                if self.opts.verbose {
                    self.warn(&format!(
                        "{}: error while sending ping: {}",
                        host.display, error
                    ));
                }
            }
            ProbeOutcome::Duplicate {
                rtt_ns,
                bytes,
                from,
            } => {
                if !self.opts.per_probe {
                    let mut line = format!(
                        "{} : duplicate for [{}], {} bytes, {} ms",
                        host.display,
                        ping_index,
                        bytes,
                        format_rtt(*rtt_ns)
                    );
                    if *from != host.addr {
                        line.push_str(&format!(" [<- {}]", from));
                    }
                    eprintln!("{}", line);
                }
            }
            ProbeOutcome::OtherIcmp { kind, from } => {
                self.warn(&format!(
                    "{} from {} for ICMP Echo sent to {}",
                    kind, from, host.display
                ));
            }
        }
    }

    fn on_interval_tick(&mut self, hosts: &[HostEntry], now_ns: i64) {
        let w = self.opts.name_width;
        if self.opts.verbose || self.opts.per_probe {
            eprintln!();
        }
        eprintln!("[{}]", local_time(now_ns).format("%H:%M:%S"));
        for host in hosts {
            let outage = self.opts.outage.then_some(self.opts.period_ns);
            eprintln!(
                "{:<w$} :{}",
                host.display,
                counters_summary(&host.interval, outage)
            );
        }
    }

    fn on_finish(&mut self, hosts: &[HostEntry], stats: &GlobalStats, elapsed_ns: i64) {
        let w = self.opts.name_width;

        for host in hosts {
            if !host.is_alive() && (self.opts.verbose || self.opts.show_unreachable) {
                if self.opts.verbose {
                    eprintln!("{} is unreachable", host.display);
                } else {
                    // bare list on stdout for scripting
                    println!("{}", host.display);
                }
            }
        }

        if self.opts.per_host_summary {
            if self.opts.verbose || self.opts.per_probe {
                eprintln!();
            }
            for host in hosts {
                if self.opts.report_all_rtts {
                    let mut line = format!("{:<w$} :", host.display);
                    for resp in host.resp_times.iter().take(host.total.sent as usize) {
                        match resp.rtt() {
                            Some(ns) => line.push_str(&format!(" {}", format_rtt(ns))),
                            None => line.push_str(" -"),
                        }
                    }
                    eprintln!("{}", line);
                } else {
                    let outage = self.opts.outage.then_some(self.opts.period_ns);
                    eprintln!(
                        "{:<w$} :{}",
                        host.display,
                        counters_summary(&host.total, outage)
                    );
                }
            }
        }

        if self.opts.final_stats {
            let unreachable = hosts.iter().filter(|h| !h.is_alive()).count();
            eprintln!();
            eprintln!(" {:7} targets", hosts.len());
            eprintln!(" {:7} alive", stats.num_alive);
            eprintln!(" {:7} unreachable", unreachable);
            eprintln!(" {:7} unknown addresses", self.num_noaddress);
            eprintln!();
            eprintln!(" {:7} timeouts (waiting for response)", stats.num_timeouts);
            eprintln!(" {:7} ICMP Echos sent", stats.num_sent);
            eprintln!(" {:7} ICMP Echo Replies received", stats.num_received);
            eprintln!(" {:7} other ICMP received", stats.num_other_icmp);
            eprintln!();
            if stats.total_replies > 0 {
                eprintln!(" {} ms (min round trip time)", format_rtt(stats.min_reply));
                eprintln!(
                    " {} ms (avg round trip time)",
                    format_rtt(stats.sum_replies / stats.total_replies as i64)
                );
                eprintln!(" {} ms (max round trip time)", format_rtt(stats.max_reply));
            } else {
                eprintln!(" 0 ms (min round trip time)");
                eprintln!(" 0 ms (avg round trip time)");
                eprintln!(" 0 ms (max round trip time)");
            }
            eprintln!(" {:12.3} sec (elapsed real time)", elapsed_ns as f64 / 1e9);
            eprintln!();
        }

        if self.opts.min_reachable > 0 {
            let reachable = hosts.iter().filter(|h| h.is_alive()).count();
            if reachable >= self.opts.min_reachable {
                println!(
                    "Enough hosts reachable (required: {}, reachable: {})",
                    self.opts.min_reachable, reachable
                );
            } else {
                println!(
                    "Not enough hosts reachable (required: {}, reachable: {})",
                    self.opts.min_reachable, reachable
                );
            }
        }
    }
}
