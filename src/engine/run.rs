//! The probing engine: a single-threaded event loop over two time-sorted
//! queues.
//!
//! Bookkeeping per probe:
//!
//! 1. when a ping is sent, a timeout event is queued at `now + timeout`,
//!    and in count/loop mode the next ping event at `ev_time + period`
//! 2. when a reply is accepted, the timeout event is removed (the seqmap
//!    points back at it) and both sent and received counters move
//! 3. when a timeout fires, only the sent counter moves; default mode may
//!    then issue a retry with a backed-off timeout
//!
//! Timeouts are processed before sends within one wake-up so a retry sees
//! the already-updated per-host timeout.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::clock::Clock;
use crate::engine::event::{EventArena, EventQueue};
use crate::engine::seqmap::SeqMap;
use crate::probe::{
    Decoded, DiscardReason, RequestKind, Transport, decode_v4, decode_v6, echo_request,
    get_identifier, ms_since_midnight_utc, timestamp_request,
};
use crate::report::{ProbeOutcome, Reporter};
use crate::state::{HostEntry, RespTime};

const RECV_BUFSIZE: usize = 4096;

/// Probing mode. Default mode retries each host until a reply or the retry
/// budget is exhausted; count and loop modes run on a fixed per-host
/// cadence where a timeout is terminal for that probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Default,
    Count(u32),
    Loop,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: Mode,
    /// Minimum gap between any two sends, across all hosts
    pub interval_ns: i64,
    /// Gap between successive sends to one host (count/loop)
    pub period_ns: i64,
    pub initial_timeout_ns: i64,
    pub retries: u32,
    pub backoff_factor: f64,
    pub backoff_enabled: bool,
    pub payload_size: usize,
    pub random_payload: bool,
    pub request: RequestKind,
    /// Discard replies whose source is not the target address
    pub check_source: bool,
    /// 0 disables periodic interval reports
    pub report_interval_ns: i64,
    pub cumulative_stats: bool,
    pub min_reachable: usize,
    pub fast_reachable: bool,
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Default,
            interval_ns: 10_000_000,
            period_ns: 1_000_000_000,
            initial_timeout_ns: 500_000_000,
            retries: 3,
            backoff_factor: 1.5,
            backoff_enabled: true,
            payload_size: crate::probe::DEFAULT_PAYLOAD_SIZE,
            random_payload: false,
            request: RequestKind::Echo,
            check_source: false,
            report_interval_ns: 0,
            cumulative_stats: false,
            min_reachable: 0,
            fast_reachable: false,
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Per-probe outcome slots a host needs (none in loop mode).
    pub fn resp_slots(&self) -> usize {
        match self.mode {
            Mode::Loop => 0,
            Mode::Count(c) => (c as usize).max(self.retries as usize + 1),
            Mode::Default => self.retries as usize + 1,
        }
    }

    /// Events that can be in flight per host, sizing the event arenas.
    pub fn event_slots(&self) -> usize {
        match self.mode {
            Mode::Count(c) => c as usize,
            Mode::Loop => {
                if self.period_ns > self.initial_timeout_ns {
                    1
                } else {
                    1 + (self.initial_timeout_ns / self.period_ns.max(1)) as usize
                }
            }
            Mode::Default => 1,
        }
    }

    fn report_enabled(&self) -> bool {
        self.report_interval_ns > 0 && self.mode != Mode::Default
    }
}

/// Run-wide counters, reported in the `--stats` block and used for the
/// exit code.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalStats {
    pub num_timeouts: u64,
    pub num_sent: u64,
    pub num_received: u64,
    pub num_other_icmp: u64,
    pub num_alive: usize,
    pub min_reply: i64,
    pub max_reply: i64,
    pub sum_replies: i64,
    pub total_replies: u64,
}

/// Flags written by the signal handlers, polled once per loop iteration.
#[derive(Clone)]
pub struct SignalFlags {
    /// SIGINT: leave the loop after the current iteration
    pub finish_requested: Arc<AtomicBool>,
    /// SIGQUIT: emit an interval report
    pub status_snapshot: Arc<AtomicBool>,
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self {
            finish_requested: Arc::new(AtomicBool::new(false)),
            status_snapshot: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct Engine<T: Transport, C: Clock> {
    cfg: EngineConfig,
    hosts: Vec<HostEntry>,
    ping_arena: EventArena,
    ping_q: EventQueue,
    timeout_arena: EventArena,
    timeout_q: EventQueue,
    seqmap: SeqMap,
    transport: T,
    clock: C,
    signals: SignalFlags,
    ident: u16,
    now_ns: i64,
    last_send_ns: i64,
    next_report_ns: i64,
    start_ns: i64,
    end_ns: i64,
    stats: GlobalStats,
}

impl<T: Transport, C: Clock> Engine<T, C> {
    /// Build the engine over an ingested host table and schedule the first
    /// probe of every host for "now" (equal times keep host order, so the
    /// first round is sent round-robin).
    pub fn new(
        cfg: EngineConfig,
        hosts: Vec<HostEntry>,
        transport: T,
        clock: C,
        signals: SignalFlags,
    ) -> Self {
        let slots = cfg.event_slots();
        let mut ping_arena = EventArena::new(hosts.len(), slots);
        let mut ping_q = EventQueue::new();
        let timeout_arena = EventArena::new(hosts.len(), slots);

        let now_ns = clock.now_ns();
        for host in &hosts {
            ping_q.schedule(&mut ping_arena, host.index as u32, 0, now_ns);
        }

        let next_report_ns = now_ns + cfg.report_interval_ns;
        Self {
            cfg,
            hosts,
            ping_arena,
            ping_q,
            timeout_arena,
            timeout_q: EventQueue::new(),
            seqmap: SeqMap::new(),
            transport,
            clock,
            signals,
            ident: get_identifier(),
            now_ns,
            last_send_ns: 0,
            next_report_ns,
            start_ns: now_ns,
            end_ns: now_ns,
            stats: GlobalStats::default(),
        }
    }

    pub fn hosts(&self) -> &[HostEntry] {
        &self.hosts
    }

    pub fn stats(&self) -> &GlobalStats {
        &self.stats
    }

    pub fn elapsed_ns(&self) -> i64 {
        self.end_ns - self.start_ns
    }

    fn finish_requested(&self) -> bool {
        self.signals.finish_requested.load(Ordering::Relaxed)
    }

    /// Drive the loop until both queues drain or a finish is requested.
    pub fn run(&mut self, reporter: &mut dyn Reporter) {
        self.now_ns = self.clock.now_ns();

        while !(self.ping_q.is_empty() && self.timeout_q.is_empty()) {
            // Timeout event due?
            if let Some(t) = self.timeout_q.head_time(&self.timeout_arena)
                && t <= self.now_ns
            {
                let id = self.timeout_q.dequeue(&mut self.timeout_arena).unwrap();
                let slot = *self.timeout_arena.slot(id);
                let host_ix = slot.host as usize;
                let index = slot.ping_index as usize;

                self.record_timeout(host_ix, index, reporter);

                // Retry with a longer deadline, default mode only
                if self.cfg.mode == Mode::Default
                    && self.hosts[host_ix].total.sent < self.cfg.retries as u64 + 1
                {
                    if self.cfg.backoff_enabled {
                        let h = &mut self.hosts[host_ix];
                        h.timeout_ns = (h.timeout_ns as f64 * self.cfg.backoff_factor) as i64;
                    }
                    self.send_ping(host_ix, index, reporter);
                }
                continue;
            }

            // Ping event due? The global interval can force the send to
            // slip; the wait below then wakes us exactly when it is legal.
            if let Some(t) = self.ping_q.head_time(&self.ping_arena)
                && t <= self.now_ns
                && self.now_ns - self.last_send_ns >= self.cfg.interval_ns
            {
                let id = self.ping_q.dequeue(&mut self.ping_arena).unwrap();
                let slot = *self.ping_arena.slot(id);
                let host_ix = slot.host as usize;
                let index = slot.ping_index as usize;
                let ev_time = slot.time_ns;

                self.send_ping(host_ix, index, reporter);

                // Next probe keeps the per-host cadence anchored on the
                // scheduled time, not on when we actually woke up
                let more = match self.cfg.mode {
                    Mode::Loop => true,
                    Mode::Count(c) => index + 1 < c as usize,
                    Mode::Default => false,
                };
                if more {
                    self.ping_q.schedule(
                        &mut self.ping_arena,
                        slot.host,
                        index + 1,
                        ev_time + self.cfg.period_ns,
                    );
                }
            }

            let Some(wait_ns) = self.next_wait() else {
                break;
            };

            if self.finish_requested() {
                break;
            }

            // Receive replies; this is the only place the loop sleeps
            if self.wait_for_reply(wait_ns, reporter) {
                while self.wait_for_reply(0, reporter) {}
            }

            self.now_ns = self.clock.now_ns();

            if self.signals.status_snapshot.swap(false, Ordering::Relaxed) {
                self.interval_report(reporter);
            }

            if self.cfg.report_enabled() && self.now_ns >= self.next_report_ns {
                self.interval_report(reporter);
                while self.now_ns >= self.next_report_ns {
                    self.next_report_ns += self.cfg.report_interval_ns;
                }
            }
        }

        self.end_ns = self.clock.now_ns();
    }

    /// Earliest of: next ping (clamped so two sends stay `interval` apart),
    /// next timeout, next report. None when nothing is scheduled.
    fn next_wait(&self) -> Option<i64> {
        let mut wait: Option<i64> = None;

        if let Some(t) = self.ping_q.head_time(&self.ping_arena) {
            let mut w = (t - self.now_ns).max(0);
            if w < self.cfg.interval_ns {
                let since_last = self.now_ns - self.last_send_ns;
                if since_last < self.cfg.interval_ns {
                    w = self.cfg.interval_ns - since_last;
                }
            }
            wait = Some(w);
        }

        if let Some(t) = self.timeout_q.head_time(&self.timeout_arena) {
            let w = (t - self.now_ns).max(0);
            wait = Some(wait.map_or(w, |cur| cur.min(w)));
        }

        if self.cfg.report_enabled() {
            let w = (self.next_report_ns - self.now_ns).max(0);
            wait = Some(wait.map_or(w, |cur| cur.min(w)));
        }

        wait
    }

    fn record_timeout(&mut self, host_ix: usize, index: usize, reporter: &mut dyn Reporter) {
        {
            let h = &mut self.hosts[host_ix];
            h.total.sent += 1;
            h.interval.sent += 1;
            if let Some(r) = h.resp_times.get_mut(index) {
                *r = RespTime::Timeout;
            }
        }
        self.stats.num_timeouts += 1;
        reporter.on_probe_result(&self.hosts[host_ix], index, &ProbeOutcome::Timeout);
    }

    fn send_ping(&mut self, host_ix: usize, index: usize, reporter: &mut dyn Reporter) {
        self.now_ns = self.clock.now_ns();

        let seq = self.seqmap.add(host_ix as u32, index, self.now_ns);
        let (addr, timeout_ns) = {
            let h = &self.hosts[host_ix];
            (h.addr, h.timeout_ns)
        };
        let packet = match self.cfg.request {
            RequestKind::Echo => echo_request(
                self.ident,
                seq,
                self.cfg.payload_size,
                self.cfg.random_payload,
                self.now_ns,
                addr.is_ipv6(),
            ),
            RequestKind::Timestamp => {
                timestamp_request(self.ident, seq, ms_since_midnight_utc(self.now_ns))
            }
        };

        let send_result = self.transport.send_to(&packet, addr);
        // A host reported down by the local stack still counts as probed
        // and may time out normally.
        let failed = match &send_result {
            Ok(_) => false,
            Err(e) => e.raw_os_error() != Some(libc::EHOSTDOWN),
        };

        {
            let h = &mut self.hosts[host_ix];
            h.last_send_ns = self.now_ns;
            if failed {
                h.total.sent += 1;
                h.interval.sent += 1;
                if let Some(r) = h.resp_times.get_mut(index) {
                    *r = RespTime::Error;
                }
            } else if let Some(r) = h.resp_times.get_mut(index) {
                *r = RespTime::Waiting;
            }
        }

        if failed {
            let error = send_result.unwrap_err().to_string();
            reporter.on_probe_result(
                &self.hosts[host_ix],
                index,
                &ProbeOutcome::SendError { error },
            );
        } else {
            self.timeout_q.schedule(
                &mut self.timeout_arena,
                host_ix as u32,
                index,
                self.now_ns + timeout_ns,
            );
        }

        self.stats.num_sent += 1;
        self.last_send_ns = self.now_ns;
    }

    /// Block up to `wait_ns` for one datagram and fold it into the host
    /// table. Returns true when a datagram was consumed, so the caller can
    /// drain the queue with zero-wait calls.
    fn wait_for_reply(&mut self, wait_ns: i64, reporter: &mut dyn Reporter) -> bool {
        let mut buf = [0u8; RECV_BUFSIZE];
        let Some(dg) = self.transport.recv(&mut buf, wait_ns) else {
            return false;
        };
        self.now_ns = self.clock.now_ns();
        let recv_time = dg.recv_time_ns.unwrap_or(self.now_ns);

        let data = &buf[..dg.len.min(RECV_BUFSIZE)];
        let decoded = match dg.src {
            IpAddr::V4(_) => decode_v4(
                data,
                self.cfg.request,
                self.ident,
                self.transport.v4_includes_ip_header(),
            ),
            IpAddr::V6(_) => decode_v6(data, self.ident),
        };

        match decoded {
            Decoded::Discard(DiscardReason::TooShort(len)) => {
                if self.cfg.verbose {
                    eprintln!(
                        "received packet too short for ICMP ({} bytes from {})",
                        len, dg.src
                    );
                }
                true
            }
            Decoded::Discard(_) => true,
            Decoded::OtherIcmp { seq, kind } => {
                // Diagnostic only: the probe stays pending and is allowed
                // to time out.
                if let Some(entry) = self.seqmap.fetch(seq, self.now_ns) {
                    self.stats.num_other_icmp += 1;
                    reporter.on_probe_result(
                        &self.hosts[entry.host as usize],
                        entry.ping_index as usize,
                        &ProbeOutcome::OtherIcmp {
                            kind,
                            from: dg.src,
                        },
                    );
                }
                true
            }
            Decoded::Reply {
                seq,
                ttl,
                tos,
                icmp_len,
                timestamps,
            } => {
                let Some(entry) = self.seqmap.fetch(seq, self.now_ns) else {
                    return true;
                };
                let host_ix = entry.host as usize;
                let index = entry.ping_index as usize;
                let rtt = recv_time - entry.send_time_ns;

                self.hosts[host_ix].recv_total += 1;
                self.stats.num_received += 1;

                if self.cfg.check_source && dg.src != self.hosts[host_ix].addr {
                    return true;
                }

                if self.hosts[host_ix]
                    .resp_times
                    .get(index)
                    .is_some_and(|r| r.is_rtt())
                {
                    reporter.on_probe_result(
                        &self.hosts[host_ix],
                        index,
                        &ProbeOutcome::Duplicate {
                            rtt_ns: rtt,
                            bytes: icmp_len,
                            from: dg.src,
                        },
                    );
                    return true;
                }

                // A reply slower than the deadline has already been
                // recorded as a timeout
                if rtt > self.hosts[host_ix].timeout_ns {
                    return true;
                }

                {
                    let h = &mut self.hosts[host_ix];
                    h.total.sent += 1;
                    h.interval.sent += 1;
                    h.total.add_reply(rtt);
                    h.interval.add_reply(rtt);
                    if let Some(r) = h.resp_times.get_mut(index) {
                        *r = RespTime::Rtt(rtt);
                    }
                    // backoff ends with the first reply
                    h.timeout_ns = self.cfg.initial_timeout_ns;
                }

                let s = &mut self.stats;
                if s.max_reply == 0 || rtt > s.max_reply {
                    s.max_reply = rtt;
                }
                if s.min_reply == 0 || rtt < s.min_reply {
                    s.min_reply = rtt;
                }
                s.sum_replies += rtt;
                s.total_replies += 1;

                let tid = self.timeout_arena.slot_id(entry.host, index);
                if self.timeout_arena.is_queued(tid)
                    && self.timeout_arena.slot(tid).ping_index as usize == index
                {
                    self.timeout_q.remove(&mut self.timeout_arena, tid);
                }

                if self.hosts[host_ix].total.recv == 1 {
                    self.stats.num_alive += 1;
                    if self.cfg.fast_reachable && self.stats.num_alive >= self.cfg.min_reachable {
                        self.signals.finish_requested.store(true, Ordering::Relaxed);
                    }
                }

                reporter.on_probe_result(
                    &self.hosts[host_ix],
                    index,
                    &ProbeOutcome::Reply {
                        rtt_ns: rtt,
                        bytes: icmp_len,
                        from: dg.src,
                        ttl,
                        tos,
                        timestamps,
                        recv_time_ns: recv_time,
                    },
                );
                true
            }
        }
    }

    fn interval_report(&mut self, reporter: &mut dyn Reporter) {
        reporter.on_interval_tick(&self.hosts, self.now_ns);
        if !self.cfg.cumulative_stats {
            for h in &mut self.hosts {
                h.reset_interval();
            }
        }
    }
}
