use clap::Parser;
use std::io;
use std::process::exit;

use reach::cli::Args;
use reach::config::Config;
use reach::engine::{Engine, GlobalStats, SignalFlags, WallClock};
use reach::probe::SocketMux;
use reach::report::{ConsoleReporter, Reporter};
use reach::state::HostEntry;
use reach::target::{FamilyFilter, Ingestor};

fn main() {
    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("reach: {}", e);
        exit(3);
    }
    let config = Config::from(&args);
    exit(run(&args, config));
}

fn run(args: &Args, mut config: Config) -> i32 {
    // Sockets are opened first so privileges can be dropped before
    // anything else happens
    let need_v4 = config.family != FamilyFilter::V6;
    let need_v6 = config.family != FamilyFilter::V4;
    let mux = match SocketMux::open(need_v4, need_v6, &config.socket) {
        Ok(mux) => mux,
        Err(e) => {
            eprintln!("reach: {:#}", e);
            return 4;
        }
    };

    if let Some(ref iface) = config.iface
        && let Err(e) = mux.bind_device(iface)
    {
        eprintln!("reach: {:#}", e);
        return 1;
    }

    if let Err(e) = drop_privileges() {
        eprintln!("reach: {}", e);
        return 4;
    }

    // Target ingestion: positional args, generation, a file, or stdin
    let mut ingestor = Ingestor::new(config.family, config.all_addrs, config.naming, config.quiet);
    if config.generate {
        if let Err(e) = ingestor.add_generate(&args.targets) {
            eprintln!("reach: {:#}", e);
            return 1;
        }
    } else if !args.targets.is_empty() {
        for name in &args.targets {
            ingestor.add_name(name);
        }
    } else {
        let path = config.file.as_deref().unwrap_or("-");
        if let Err(e) = ingestor.add_file(path) {
            eprintln!("reach: {}: {:#}", path, e);
            return 4;
        }
    }

    let num_noaddress = ingestor.num_noaddress;
    if ingestor.targets.is_empty() {
        return if num_noaddress > 0 { 2 } else { 1 };
    }

    let trials = config.engine.resp_slots();
    let hosts: Vec<HostEntry> = ingestor
        .targets
        .into_iter()
        .enumerate()
        .map(|(i, t)| {
            HostEntry::new(
                i,
                t.name,
                t.display,
                t.addr,
                config.engine.initial_timeout_ns,
                trials,
            )
        })
        .collect();
    config.display.name_width = hosts.iter().map(|h| h.display.len()).max().unwrap_or(0);

    // Signal handlers only flip atomic flags; the loop polls them
    let signals = SignalFlags::default();
    let registered = signal_hook::flag::register(
        signal_hook::consts::SIGINT,
        signals.finish_requested.clone(),
    )
    .and_then(|_| {
        signal_hook::flag::register(
            signal_hook::consts::SIGQUIT,
            signals.status_snapshot.clone(),
        )
    });
    if let Err(e) = registered {
        eprintln!("reach: cannot install signal handlers: {}", e);
        return 4;
    }

    let min_reachable = config.engine.min_reachable;
    let mut reporter = ConsoleReporter::new(config.display, num_noaddress);
    let mut engine = Engine::new(config.engine, hosts, mux, WallClock, signals);
    engine.run(&mut reporter);
    reporter.on_finish(engine.hosts(), engine.stats(), engine.elapsed_ns());

    exit_code(engine.hosts(), engine.stats(), num_noaddress, min_reachable)
}

/// Raw sockets need privilege only at creation time; run as the invoking
/// user afterwards. Continuing elevated after a failed drop would be a
/// security hole, so that is fatal.
fn drop_privileges() -> Result<(), String> {
    let uid = unsafe { libc::getuid() };
    let euid = unsafe { libc::geteuid() };
    if euid != uid && unsafe { libc::setuid(uid) } != 0 {
        return Err(format!(
            "cannot drop privileges: {}",
            io::Error::last_os_error()
        ));
    }
    Ok(())
}

fn exit_code(
    hosts: &[HostEntry],
    stats: &GlobalStats,
    num_noaddress: usize,
    min_reachable: usize,
) -> i32 {
    if min_reachable > 0 {
        return if stats.num_alive >= min_reachable { 0 } else { 1 };
    }
    if num_noaddress > 0 {
        return 2;
    }
    if stats.num_alive != hosts.len() {
        return 1;
    }
    0
}
