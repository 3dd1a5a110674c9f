//! DNS block-list and country lookups.
//!
//! Both use the reverse-octet technique: for `1.2.3.4` and server
//! `zen.spamhaus.org` the query is `4.3.2.1.zen.spamhaus.org`. A block
//! list answers with any A record when the address is listed. A country
//! server answers with an address whose low two octets carry the numeric
//! country code.
//!
//! Every failure is fail-open: not listed, country 0.

use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net;
use tracing::{debug, info};

/// Country code returned when nothing could be resolved.
pub const UNKNOWN_COUNTRY: u16 = 0;

/// Source of A records. Swappable so tests never touch the network.
pub trait DnsLookup: Send + Sync {
    /// Resolve `name` to its IPv4 addresses.
    fn lookup_ipv4<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<Ipv4Addr>>> + Send + 'a>>;
}

/// Lookup through the system resolver via `tokio::net::lookup_host`.
pub struct SystemLookup;

impl DnsLookup for SystemLookup {
    fn lookup_ipv4<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<Ipv4Addr>>> + Send + 'a>> {
        Box::pin(async move {
            // lookup_host needs a port
            let addrs = net::lookup_host(format!("{name}:0")).await?;
            Ok(addrs
                .filter_map(|addr| match addr.ip() {
                    std::net::IpAddr::V4(v4) => Some(v4),
                    std::net::IpAddr::V6(_) => None,
                })
                .collect())
        })
    }
}

/// Classifies source addresses against block-list and country servers.
#[derive(Clone)]
pub struct DnsblResolver {
    lookup: Arc<dyn DnsLookup>,
}

impl DnsblResolver {
    pub fn new(lookup: Arc<dyn DnsLookup>) -> Self {
        Self { lookup }
    }

    /// Resolver backed by the operating system.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemLookup))
    }

    /// Whether `ip` is listed on any of `servers`.
    ///
    /// An empty server list skips the check without any lookup.
    pub async fn is_blacklisted(&self, ip: &str, servers: &[String]) -> bool {
        self.listed_on(ip, servers).await.is_some()
    }

    /// The first server in `servers` that lists `ip`, if any.
    pub async fn listed_on(&self, ip: &str, servers: &[String]) -> Option<String> {
        if servers.is_empty() {
            return None;
        }
        let reversed = reverse_octets(ip)?;

        for server in servers.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let query = format!("{reversed}.{server}");
            match self.lookup.lookup_ipv4(&query).await {
                Ok(addrs) if !addrs.is_empty() => {
                    info!(ip, server, answer = %addrs[0], "address is block-listed");
                    return Some(server.to_string());
                }
                Ok(_) => debug!(ip, server, "no records"),
                // NXDOMAIN means not listed; anything else is treated the same.
                Err(e) => debug!(ip, server, error = %e, "block-list lookup failed"),
            }
        }
        None
    }

    /// Numeric country code for `ip`, or [`UNKNOWN_COUNTRY`].
    pub async fn country_code(&self, ip: &str, server: &str) -> u16 {
        let Some(reversed) = reverse_octets(ip) else {
            return UNKNOWN_COUNTRY;
        };
        let server = server.trim();
        if server.is_empty() {
            return UNKNOWN_COUNTRY;
        }

        let query = format!("{reversed}.{server}");
        match self.lookup.lookup_ipv4(&query).await {
            Ok(addrs) => addrs
                .first()
                .map(|addr| decode_country(*addr))
                .unwrap_or(UNKNOWN_COUNTRY),
            Err(e) => {
                debug!(ip, server, error = %e, "country lookup failed");
                UNKNOWN_COUNTRY
            }
        }
    }
}

/// `a.b.c.d` → `d.c.b.a`, or `None` unless `ip` is a valid dotted quad.
pub fn reverse_octets(ip: &str) -> Option<String> {
    let addr: Ipv4Addr = ip.trim().parse().ok()?;
    let [a, b, c, d] = addr.octets();
    Some(format!("{d}.{c}.{b}.{a}"))
}

fn decode_country(addr: Ipv4Addr) -> u16 {
    let octets = addr.octets();
    u16::from_be_bytes([octets[2], octets[3]])
}
