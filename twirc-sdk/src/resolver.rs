//! Server address resolution with per-address failure tracking.
//!
//! A server is configured as a comma-separated host list plus a
//! comma-separated port list. Every (host, ip, port) combination is a
//! candidate; the candidate with the fewest recent failures wins, ties going
//! to configuration order. One bad IP behind round-robin DNS therefore gets
//! skipped after it fails instead of being retried forever.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Error, Result};

/// Failures older than this no longer count against an address.
const FAILURE_MEMORY: Duration = Duration::from_secs(30 * 60);

/// A resolved candidate address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServerAddress {
    pub host: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl ServerAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("Unknown host {host}: {detail}")]
    UnknownHost { host: String, detail: String },
    #[error("No address configured")]
    NoCandidates,
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last: Instant,
}

#[derive(Debug, Default)]
pub struct AddressResolver {
    failures: Mutex<HashMap<SocketAddr, FailureRecord>>,
}

impl AddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up every host in `host_spec` and pick the best candidate.
    ///
    /// Hosts that fail to resolve are skipped as long as another one
    /// resolves; if none does, the first lookup error is returned.
    pub async fn resolve(&self, host_spec: &str, ports: &[u16]) -> Result<ServerAddress, ResolveError> {
        let hosts = parse_hosts(host_spec);
        if hosts.is_empty() || ports.is_empty() {
            return Err(ResolveError::NoCandidates);
        }

        let mut candidates = Vec::new();
        let mut first_error = None;
        for host in &hosts {
            match lookup(host).await {
                Ok(ips) => {
                    for &port in ports {
                        candidates.extend(ips.iter().map(|&ip| ServerAddress {
                            host: host.clone(),
                            ip,
                            port,
                        }));
                    }
                }
                Err(e) => {
                    tracing::debug!(host = %host, error = %e, "Host lookup failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.pick_best(&candidates).ok_or_else(|| {
            first_error.unwrap_or(ResolveError::NoCandidates)
        })
    }

    /// Candidate with the fewest recent failures; earliest wins ties.
    pub fn pick_best(&self, candidates: &[ServerAddress]) -> Option<ServerAddress> {
        let failures = self.failures.lock();
        let now = Instant::now();
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(i, c)| (recent_failures(&failures, &c.socket_addr(), now), *i))
            .map(|(_, c)| c.clone())
    }

    pub fn record_failure(&self, address: &ServerAddress) {
        let now = Instant::now();
        let mut failures = self.failures.lock();
        let record = failures.entry(address.socket_addr()).or_insert(FailureRecord {
            count: 0,
            last: now,
        });
        if now.duration_since(record.last) > FAILURE_MEMORY {
            record.count = 0;
        }
        record.count += 1;
        record.last = now;
        tracing::debug!(address = %address, ip = %address.ip, failures = record.count, "Recorded connection failure");
    }

    /// Forget the failure history of an address that got us registered.
    pub fn record_success(&self, address: &ServerAddress) {
        self.failures.lock().remove(&address.socket_addr());
    }

    pub fn failure_count(&self, address: &ServerAddress) -> u32 {
        recent_failures(&self.failures.lock(), &address.socket_addr(), Instant::now())
    }
}

fn recent_failures(failures: &HashMap<SocketAddr, FailureRecord>, addr: &SocketAddr, now: Instant) -> u32 {
    match failures.get(addr) {
        Some(record) if now.duration_since(record.last) <= FAILURE_MEMORY => record.count,
        _ => 0,
    }
}

async fn lookup(host: &str) -> Result<Vec<IpAddr>, ResolveError> {
    let unknown = |detail: String| ResolveError::UnknownHost {
        host: host.to_string(),
        detail,
    };
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| unknown(e.to_string()))?;
    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }
    if ips.is_empty() {
        return Err(unknown("no addresses".to_string()));
    }
    Ok(ips)
}

/// Split a comma-separated host list, dropping blanks.
pub fn parse_hosts(spec: &str) -> Vec<String> {
    spec.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a comma-separated port list. Duplicates are dropped, order is kept.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let port: u16 = part
            .parse()
            .map_err(|_| Error::InvalidPorts(spec.to_string()))?;
        if port == 0 {
            return Err(Error::InvalidPorts(spec.to_string()));
        }
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    if ports.is_empty() {
        return Err(Error::InvalidPorts(spec.to_string()));
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, port: u16) -> ServerAddress {
        ServerAddress {
            host: "irc.example.net".to_string(),
            ip: ip.parse().unwrap(),
            port,
        }
    }

    #[test]
    fn ports_are_parsed_in_order() {
        assert_eq!(parse_ports("6667, 80,6667").unwrap(), vec![6667, 80]);
        assert_eq!(parse_ports("443").unwrap(), vec![443]);
        assert!(matches!(parse_ports(""), Err(Error::InvalidPorts(_))));
        assert!(matches!(parse_ports("6667,abc"), Err(Error::InvalidPorts(_))));
        assert!(matches!(parse_ports("0"), Err(Error::InvalidPorts(_))));
    }

    #[test]
    fn hosts_are_split_on_commas() {
        assert_eq!(parse_hosts("a.example, b.example,,"), vec!["a.example", "b.example"]);
        assert!(parse_hosts(" ").is_empty());
    }

    #[test]
    fn first_candidate_wins_without_failures() {
        let resolver = AddressResolver::new();
        let candidates = vec![addr("10.0.0.1", 6667), addr("10.0.0.2", 6667)];
        assert_eq!(resolver.pick_best(&candidates), Some(candidates[0].clone()));
        assert_eq!(resolver.pick_best(&[]), None);
    }

    #[test]
    fn failing_address_is_rotated_away() {
        let resolver = AddressResolver::new();
        let candidates = vec![addr("10.0.0.1", 6667), addr("10.0.0.1", 80), addr("10.0.0.2", 6667)];

        resolver.record_failure(&candidates[0]);
        assert_eq!(resolver.pick_best(&candidates), Some(candidates[1].clone()));

        resolver.record_failure(&candidates[1]);
        assert_eq!(resolver.pick_best(&candidates), Some(candidates[2].clone()));

        // All failed once: back to configuration order.
        resolver.record_failure(&candidates[2]);
        assert_eq!(resolver.pick_best(&candidates), Some(candidates[0].clone()));
        assert_eq!(resolver.failure_count(&candidates[0]), 1);
    }

    #[test]
    fn success_clears_history() {
        let resolver = AddressResolver::new();
        let a = addr("10.0.0.1", 6667);
        resolver.record_failure(&a);
        resolver.record_failure(&a);
        assert_eq!(resolver.failure_count(&a), 2);
        resolver.record_success(&a);
        assert_eq!(resolver.failure_count(&a), 0);
    }

    #[tokio::test]
    async fn ip_literals_resolve_without_dns() {
        let resolver = AddressResolver::new();
        let resolved = resolver.resolve("127.0.0.1", &[6667, 80]).await.unwrap();
        assert_eq!(resolved.ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(resolved.port, 6667);
        assert_eq!(resolved.to_string(), "127.0.0.1:6667");

        resolver.record_failure(&resolved);
        let rotated = resolver.resolve("127.0.0.1", &[6667, 80]).await.unwrap();
        assert_eq!(rotated.port, 80);
    }

    #[tokio::test]
    async fn empty_spec_has_no_candidates() {
        let resolver = AddressResolver::new();
        assert_eq!(resolver.resolve(" , ", &[6667]).await, Err(ResolveError::NoCandidates));
        assert_eq!(resolver.resolve("127.0.0.1", &[]).await, Err(ResolveError::NoCandidates));
    }
}
