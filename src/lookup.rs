//! Reverse-DNS lookups for display names, with a per-run cache.
//!
//! Lookups happen once per address during target ingestion, before the
//! probe loop starts, so the blocking resolver is fine here.

use hickory_resolver::Resolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use std::collections::HashMap;
use std::net::IpAddr;

pub struct RdnsCache {
    resolver: Option<Resolver>,
    cache: HashMap<IpAddr, Option<String>>,
}

impl Default for RdnsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RdnsCache {
    pub fn new() -> Self {
        let resolver = Resolver::new(ResolverConfig::default(), ResolverOpts::default()).ok();
        Self {
            resolver,
            cache: HashMap::new(),
        }
    }

    /// Reverse-lookup an address; None when there is no PTR record (or no
    /// resolver). Results are cached for the run.
    pub fn lookup(&mut self, ip: IpAddr) -> Option<String> {
        if let Some(cached) = self.cache.get(&ip) {
            return cached.clone();
        }

        let hostname = self
            .resolver
            .as_ref()
            .and_then(|r| r.reverse_lookup(ip).ok())
            .and_then(|lookup| {
                lookup
                    .iter()
                    .next()
                    .map(|name| name.to_string().trim_end_matches('.').to_string())
            });

        self.cache.insert(ip, hostname.clone());
        hostname
    }
}
