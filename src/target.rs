//! Target ingestion: name resolution, target files, and address-range /
//! CIDR generation.
//!
//! Everything here runs before the probe loop starts; resolution failures
//! are per-target warnings, counted so the exit code can reflect them.

use anyhow::{Result, bail};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use crate::lookup::RdnsCache;

/// Upper bound on how many addresses `--generate` will expand to.
pub const MAX_GENERATE: u64 = 131072;
/// Longest target token accepted from a target file.
pub const MAX_TARGET_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FamilyFilter {
    #[default]
    Any,
    V4,
    V6,
}

impl FamilyFilter {
    fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            FamilyFilter::Any => true,
            FamilyFilter::V4 => ip.is_ipv4(),
            FamilyFilter::V6 => ip.is_ipv6(),
        }
    }
}

/// One resolved target, ready for the host table.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub display: String,
    pub addr: IpAddr,
}

/// Display-name policy for resolved targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamingOptions {
    /// Show targets by address
    pub by_addr: bool,
    /// Reverse-lookup targets that were given numerically
    pub lookup_numeric: bool,
    /// Reverse-lookup every target
    pub force_rdns: bool,
}

pub struct Ingestor {
    family: FamilyFilter,
    all_addrs: bool,
    naming: NamingOptions,
    quiet: bool,
    rdns: RdnsCache,
    pub targets: Vec<Target>,
    pub num_noaddress: usize,
}

impl Ingestor {
    pub fn new(family: FamilyFilter, all_addrs: bool, naming: NamingOptions, quiet: bool) -> Self {
        Self {
            family,
            all_addrs,
            naming,
            quiet,
            rdns: RdnsCache::new(),
            targets: Vec::new(),
            num_noaddress: 0,
        }
    }

    fn warn(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg);
        }
    }

    /// Resolve one user-supplied target. A name can expand to several
    /// targets when it is multi-homed and `--all` was given.
    pub fn add_name(&mut self, name: &str) {
        let was_numeric = name.parse::<IpAddr>().is_ok();

        let addrs: Vec<IpAddr> = if let Ok(ip) = name.parse::<IpAddr>() {
            vec![ip]
        } else {
            match (name, 0u16).to_socket_addrs() {
                Ok(iter) => iter.map(|sa| sa.ip()).collect(),
                Err(e) => {
                    self.warn(&format!("{}: {}", name, e));
                    self.num_noaddress += 1;
                    return;
                }
            }
        };

        let family = self.family;
        let matching: Vec<IpAddr> = addrs.into_iter().filter(|ip| family.accepts(ip)).collect();
        if matching.is_empty() {
            self.warn(&format!("{}: no address of the requested family", name));
            self.num_noaddress += 1;
            return;
        }

        self.add_addr(name, matching[0], was_numeric);
        if self.all_addrs {
            for addr in &matching[1..] {
                self.add_addr(name, *addr, was_numeric);
            }
        }
    }

    fn add_addr(&mut self, name: &str, addr: IpAddr, was_numeric: bool) {
        let do_rdns = self.naming.force_rdns || (self.naming.lookup_numeric && was_numeric);
        let printname = if do_rdns {
            self.rdns.lookup(addr).unwrap_or_else(|| name.to_string())
        } else {
            name.to_string()
        };

        let display = if self.naming.by_addr {
            if do_rdns || self.naming.lookup_numeric {
                format!("{} ({})", printname, addr)
            } else {
                addr.to_string()
            }
        } else {
            printname
        };

        self.targets.push(Target {
            name: name.to_string(),
            display,
            addr,
        });
    }

    /// Read targets from a file, one per line; `-` means stdin. Blank
    /// lines and `#` comments are skipped, only the first whitespace-
    /// separated token of a line is used.
    pub fn add_file(&mut self, path: &str) -> Result<()> {
        let reader: Box<dyn BufRead> = if path == "-" {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            Box::new(BufReader::new(File::open(path)?))
        };

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(token) = line.split_whitespace().next() else {
                continue;
            };
            if token.len() > MAX_TARGET_NAME_LEN {
                let head: String = token.chars().take(32).collect();
                self.warn(&format!("{}...: target name too long", head));
                continue;
            }
            self.add_name(token);
        }
        Ok(())
    }

    /// Expand `--generate` arguments: either one CIDR prefix or an
    /// inclusive start/end address pair.
    pub fn add_generate(&mut self, args: &[String]) -> Result<()> {
        match args {
            [cidr] if cidr.contains('/') => self.add_cidr(cidr),
            [start, end] => self.add_range(start, end),
            _ => bail!("--generate takes a CIDR prefix or a start and end address"),
        }
    }

    fn add_cidr(&mut self, spec: &str) -> Result<()> {
        let (addr_str, len_str) = spec.split_once('/').unwrap();
        let prefix_len: u32 = len_str
            .parse()
            .map_err(|_| anyhow::anyhow!("bad prefix length in {}", spec))?;

        match addr_str.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => {
                if prefix_len > 32 {
                    bail!("bad prefix length in {}", spec);
                }
                let base = u32::from(addr);
                let mask = if prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - prefix_len)
                };
                let network = base & mask;
                let broadcast = network | !mask;

                // For real subnets the network and broadcast addresses are
                // not probed; /31 and /32 have no such addresses.
                let (lo, hi) = if prefix_len < 31 {
                    (network + 1, broadcast - 1)
                } else {
                    (network, broadcast)
                };
                self.generate_v4(lo, hi)
            }
            Ok(IpAddr::V6(addr)) => {
                if prefix_len > 128 {
                    bail!("bad prefix length in {}", spec);
                }
                let base = u128::from(addr);
                let mask = if prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefix_len)
                };
                self.generate_v6(base & mask, (base & mask) | !mask)
            }
            Err(_) => bail!("bad network address in {}", spec),
        }
    }

    fn add_range(&mut self, start: &str, end: &str) -> Result<()> {
        match (start.parse::<IpAddr>(), end.parse::<IpAddr>()) {
            (Ok(IpAddr::V4(s)), Ok(IpAddr::V4(e))) => {
                self.generate_v4(u32::from(s), u32::from(e))
            }
            (Ok(IpAddr::V6(s)), Ok(IpAddr::V6(e))) => {
                self.generate_v6(u128::from(s), u128::from(e))
            }
            _ => bail!("bad address range {} {}", start, end),
        }
    }

    fn generate_v4(&mut self, lo: u32, hi: u32) -> Result<()> {
        if lo > hi {
            bail!("empty address range");
        }
        if (hi - lo) as u64 + 1 > MAX_GENERATE {
            bail!("range generates too many addresses (max {})", MAX_GENERATE);
        }
        for addr in lo..=hi {
            self.add_name(&Ipv4Addr::from(addr).to_string());
        }
        Ok(())
    }

    fn generate_v6(&mut self, lo: u128, hi: u128) -> Result<()> {
        if lo > hi {
            bail!("empty address range");
        }
        if hi - lo >= MAX_GENERATE as u128 {
            bail!("range generates too many addresses (max {})", MAX_GENERATE);
        }
        let mut addr = lo;
        loop {
            self.add_name(&Ipv6Addr::from(addr).to_string());
            if addr == hi {
                break;
            }
            addr += 1;
        }
        Ok(())
    }
}
