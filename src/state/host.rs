use std::net::IpAddr;

/// Outcome slot for a single probe, tracked in default and count modes.
///
/// In loop mode no per-probe record is kept; probes are only reflected in
/// the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespTime {
    /// Probe not issued yet
    Unused,
    /// Request sent, reply outstanding
    Waiting,
    /// Send failed
    Error,
    /// Deadline passed without a reply
    Timeout,
    /// Accepted reply with this round-trip time (ns)
    Rtt(i64),
}

impl RespTime {
    pub fn rtt(&self) -> Option<i64> {
        match self {
            RespTime::Rtt(ns) => Some(*ns),
            _ => None,
        }
    }

    pub fn is_rtt(&self) -> bool {
        matches!(self, RespTime::Rtt(_))
    }
}

/// One set of send/receive counters with latency extremes.
///
/// Each host carries two of these: a cumulative set for the whole run and
/// an interval set that is reset on every report tick. A zero min/max means
/// "no sample yet" (an actual 0 ns reply would be folded into the next
/// sample, which is how the reference ping tools treat it as well).
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub sent: u64,
    pub recv: u64,
    pub min_rtt: i64,
    pub max_rtt: i64,
    pub sum_rtt: i64,
}

impl Counters {
    pub fn add_reply(&mut self, rtt_ns: i64) {
        self.recv += 1;
        if self.max_rtt == 0 || rtt_ns > self.max_rtt {
            self.max_rtt = rtt_ns;
        }
        if self.min_rtt == 0 || rtt_ns < self.min_rtt {
            self.min_rtt = rtt_ns;
        }
        self.sum_rtt += rtt_ns;
    }

    /// Average RTT over accepted replies, None before the first reply.
    pub fn avg_rtt(&self) -> Option<i64> {
        if self.recv == 0 {
            None
        } else {
            Some(self.sum_rtt / self.recv as i64)
        }
    }

    /// Percentage of probes lost (0 when nothing was sent).
    pub fn loss_pct(&self) -> u64 {
        if self.sent == 0 || self.recv > self.sent {
            0
        } else {
            (self.sent - self.recv) * 100 / self.sent
        }
    }
}

/// One probed target. Created during ingestion, lives for the whole run.
#[derive(Debug, Clone)]
pub struct HostEntry {
    /// Position in the host table; also the correlation key carried in the
    /// sequence map.
    pub index: usize,
    /// Target as given by the user
    pub name: String,
    /// Text used in all output lines (name, address, or "name (addr)")
    pub display: String,
    pub addr: IpAddr,
    /// Deadline applied to the next probe; grows by the backoff factor on
    /// unanswered retries and snaps back to the initial value on a reply.
    pub timeout_ns: i64,
    pub last_send_ns: i64,
    pub total: Counters,
    pub interval: Counters,
    /// Replies received including duplicates
    pub recv_total: u64,
    /// Per-probe outcomes, empty in loop mode
    pub resp_times: Vec<RespTime>,
}

impl HostEntry {
    pub fn new(
        index: usize,
        name: String,
        display: String,
        addr: IpAddr,
        initial_timeout_ns: i64,
        trials: usize,
    ) -> Self {
        Self {
            index,
            name,
            display,
            addr,
            timeout_ns: initial_timeout_ns,
            last_send_ns: 0,
            total: Counters::default(),
            interval: Counters::default(),
            recv_total: 0,
            resp_times: vec![RespTime::Unused; trials],
        }
    }

    pub fn is_alive(&self) -> bool {
        self.total.recv > 0
    }

    pub fn reset_interval(&mut self) {
        self.interval = Counters::default();
    }
}
