//! SPF (Sender Policy Framework) evaluation
//!
//! Looks up the sender domain's `v=spf1` record and evaluates its mechanisms
//! left to right; the first matching mechanism decides. Supported mechanisms:
//! `ip4`, `ip6`, `a`, `mx`, `include` and `all`. Anything else is skipped.
//!
//! `include:` follows a first-non-neutral rule: a nested `neutral` result lets
//! evaluation continue, any other nested result is returned as-is, and a
//! failed lookup of the included record is treated as no match.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::dns::{DnsError, DnsResolver};
use super::types::SpfResult;
use crate::utils::extract_domain;

/// Nested `include:` evaluations allowed below the top-level record.
pub const MAX_INCLUDE_DEPTH: usize = 10;

#[derive(Error, Debug)]
pub enum SpfError {
    #[error("invalid email format: {0}")]
    InvalidSender(String),

    #[error("DNS lookup failed: {0}")]
    Dns(#[from] DnsError),

    #[error("invalid SPF record: {0}")]
    MalformedRecord(String),

    #[error("include chain deeper than {} records", MAX_INCLUDE_DEPTH)]
    TooDeep,

    #[error("include:{domain}: {source}")]
    Include {
        domain: String,
        #[source]
        source: Box<SpfError>,
    },
}

impl SpfError {
    /// Verdict reported alongside this error.
    pub fn result(&self) -> SpfResult {
        match self {
            SpfError::InvalidSender(_) => SpfResult::None,
            SpfError::Dns(_) => SpfResult::TempError,
            SpfError::MalformedRecord(_) | SpfError::TooDeep => SpfResult::PermError,
            SpfError::Include { source, .. } => match source.root_cause() {
                SpfError::TooDeep => SpfResult::PermError,
                _ => SpfResult::Fail,
            },
        }
    }

    fn root_cause(&self) -> &SpfError {
        match self {
            SpfError::Include { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

type EvalFuture<'a> = Pin<Box<dyn Future<Output = Result<SpfResult, SpfError>> + Send + 'a>>;

/// SPF validator
pub struct SpfValidator {
    resolver: Arc<dyn DnsResolver>,
    bypass_domain: Option<String>,
}

impl SpfValidator {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            resolver,
            bypass_domain: None,
        }
    }

    /// Report `pass` for this sender domain when the client is `127.0.0.1`.
    pub fn with_bypass_domain(mut self, domain: Option<String>) -> Self {
        self.bypass_domain = domain.filter(|d| !d.is_empty()).map(|d| d.to_lowercase());
        self
    }

    /// Check SPF for a sender
    ///
    /// # Arguments
    /// * `ip` - address of the connecting client
    /// * `sender` - sender mailbox; its domain selects the record
    /// * `helo` - HELO/EHLO name, logged only
    pub async fn check(&self, ip: IpAddr, sender: &str, helo: &str) -> Result<SpfResult, SpfError> {
        debug!(%ip, %sender, %helo, "SPF check");

        let domain =
            extract_domain(sender).map_err(|_| SpfError::InvalidSender(sender.to_string()))?;

        if self.bypass_domain.as_deref() == Some(domain.as_str())
            && ip == IpAddr::V4(Ipv4Addr::LOCALHOST)
        {
            warn!(%domain, "SPF bypass domain matched, skipping evaluation");
            return Ok(SpfResult::Pass);
        }

        let Some(record) = self.lookup_record(&domain).await? else {
            debug!(%domain, "No SPF record found");
            return Ok(SpfResult::None);
        };

        debug!(%domain, %record, "Found SPF record");
        self.evaluate_record(&record, ip, &domain, 0).await
    }

    /// `Ok(None)` when the domain publishes no `v=spf1` record.
    async fn lookup_record(&self, domain: &str) -> Result<Option<String>, DnsError> {
        match self.resolver.txt(domain).await {
            Ok(records) => Ok(records.into_iter().find(|r| r.starts_with("v=spf1 "))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Evaluate one record for `ip`; `domain` is the target of bare `a`/`mx`.
    pub fn evaluate_record<'a>(
        &'a self,
        record: &'a str,
        ip: IpAddr,
        domain: &'a str,
        depth: usize,
    ) -> EvalFuture<'a> {
        Box::pin(async move {
            if depth > MAX_INCLUDE_DEPTH {
                return Err(SpfError::TooDeep);
            }

            let mut terms = record.split_whitespace();
            if terms.next() != Some("v=spf1") {
                return Err(SpfError::MalformedRecord(record.to_string()));
            }

            for term in terms {
                let (qualifier, mechanism) = match term.chars().next() {
                    Some(q @ ('+' | '-' | '~' | '?')) => (q, &term[1..]),
                    _ => ('+', term),
                };

                let matched = if mechanism.eq_ignore_ascii_case("all") {
                    true
                } else if let Some(cidr) = mechanism.strip_prefix("ip4:") {
                    matches_ip4(cidr, ip)
                } else if let Some(cidr) = mechanism.strip_prefix("ip6:") {
                    matches_ip6(cidr, ip)
                } else if let Some(included) = mechanism.strip_prefix("include:") {
                    match self.lookup_record(included).await {
                        Ok(Some(nested)) => {
                            match self.evaluate_record(&nested, ip, included, depth + 1).await {
                                Ok(SpfResult::Neutral) => {}
                                Ok(result) => return Ok(result),
                                Err(source) => {
                                    return Err(SpfError::Include {
                                        domain: included.to_string(),
                                        source: Box::new(source),
                                    })
                                }
                            }
                        }
                        Ok(None) => debug!(%included, "Included domain has no SPF record"),
                        Err(e) => debug!(%included, error = %e, "Include lookup failed, skipping"),
                    }
                    false
                } else if let Some(spec) = DomainSpec::parse(mechanism, "a") {
                    self.matches_a(&spec, domain, ip).await
                } else if let Some(spec) = DomainSpec::parse(mechanism, "mx") {
                    self.matches_mx(&spec, domain, ip).await
                } else {
                    debug!(%term, "Skipping unsupported SPF term");
                    false
                };

                if matched {
                    let result = SpfResult::from_qualifier(qualifier);
                    debug!(%term, %result, "SPF mechanism matched");
                    return Ok(result);
                }
            }

            Ok(SpfResult::Neutral)
        })
    }

    async fn matches_a(&self, spec: &DomainSpec<'_>, domain: &str, ip: IpAddr) -> bool {
        let target = spec.domain.unwrap_or(domain);
        match self.resolver.ips(target).await {
            Ok(addrs) => addrs.iter().any(|addr| spec.matches(*addr, ip)),
            Err(e) => {
                debug!(%target, error = %e, "A lookup failed");
                false
            }
        }
    }

    async fn matches_mx(&self, spec: &DomainSpec<'_>, domain: &str, ip: IpAddr) -> bool {
        let target = spec.domain.unwrap_or(domain);
        let hosts = match self.resolver.mx(target).await {
            Ok(hosts) => hosts,
            Err(e) => {
                debug!(%target, error = %e, "MX lookup failed");
                return false;
            }
        };

        for host in hosts {
            if let Ok(addrs) = self.resolver.ips(&host).await {
                if addrs.iter().any(|addr| spec.matches(*addr, ip)) {
                    return true;
                }
            }
        }
        false
    }
}

/// `a`/`mx` arguments: `[:domain][/cidr4][//cidr6]`
#[derive(Debug, PartialEq, Eq)]
struct DomainSpec<'a> {
    domain: Option<&'a str>,
    cidr4: Option<u8>,
    cidr6: Option<u8>,
}

impl<'a> DomainSpec<'a> {
    fn parse(mechanism: &'a str, name: &str) -> Option<Self> {
        let rest = mechanism.strip_prefix(name)?;
        let (domain_part, cidr_part) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };

        let domain = match domain_part {
            "" => None,
            d => Some(d.strip_prefix(':').filter(|d| !d.is_empty())?),
        };

        let (cidr4, cidr6) = match cidr_part.split_once("//") {
            Some((v4, v6)) => (v4.strip_prefix('/'), Some(v6)),
            None => (cidr_part.strip_prefix('/'), None),
        };
        let cidr4 = match cidr4.filter(|c| !c.is_empty()) {
            Some(c) => Some(c.parse().ok()?),
            None => None,
        };
        let cidr6 = match cidr6 {
            Some(c) => Some(c.parse().ok()?),
            None => None,
        };

        Some(DomainSpec {
            domain,
            cidr4,
            cidr6,
        })
    }

    /// Equality without a prefix length, network containment with one.
    fn matches(&self, record: IpAddr, ip: IpAddr) -> bool {
        match (record, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => match self.cidr4 {
                Some(prefix) => ip4_in_network(addr, net, prefix),
                None => net == addr,
            },
            (IpAddr::V6(net), IpAddr::V6(addr)) => match self.cidr6 {
                Some(prefix) => ip6_in_network(addr, net, prefix),
                None => net == addr,
            },
            _ => false,
        }
    }
}

fn split_cidr(cidr: &str) -> (&str, Option<&str>) {
    match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (cidr, None),
    }
}

fn matches_ip4(cidr: &str, ip: IpAddr) -> bool {
    let IpAddr::V4(addr) = ip else {
        return false;
    };
    let (net, prefix) = split_cidr(cidr);
    let Ok(net) = net.parse::<Ipv4Addr>() else {
        return false;
    };
    match prefix.map(str::parse::<u8>) {
        None => ip4_in_network(addr, net, 32),
        Some(Ok(prefix)) => ip4_in_network(addr, net, prefix),
        Some(Err(_)) => false,
    }
}

fn matches_ip6(cidr: &str, ip: IpAddr) -> bool {
    let IpAddr::V6(addr) = ip else {
        return false;
    };
    let (net, prefix) = split_cidr(cidr);
    let Ok(net) = net.parse::<Ipv6Addr>() else {
        return false;
    };
    match prefix.map(str::parse::<u8>) {
        None => ip6_in_network(addr, net, 128),
        Some(Ok(prefix)) => ip6_in_network(addr, net, prefix),
        Some(Err(_)) => false,
    }
}

/// prefix 0 matches everything, prefix > 32 matches nothing
pub fn ip4_in_network(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 32 {
        return false;
    }
    let mask = !0u32 << (32 - prefix);
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

pub fn ip6_in_network(ip: Ipv6Addr, network: Ipv6Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 128 {
        return false;
    }
    let mask = !0u128 << (128 - prefix);
    (u128::from(ip) & mask) == (u128::from(network) & mask)
}
