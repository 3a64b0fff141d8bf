//! DNS lookups used by SPF, DKIM and DMARC
//!
//! [`TrustDnsResolver`] talks to the system resolver; [`StaticResolver`]
//! answers from an in-memory zone and is used by tests and offline runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// NXDOMAIN or an empty answer
    #[error("no records found for {0}")]
    NotFound(String),

    #[error("DNS timeout for {0}")]
    Timeout(String),

    #[error("DNS lookup failed for {name}: {reason}")]
    Lookup { name: String, reason: String },
}

impl DnsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DnsError::NotFound(_))
    }
}

#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// TXT records, each with its character-strings concatenated.
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError>;

    /// A and AAAA addresses.
    async fn ips(&self, name: &str) -> Result<Vec<IpAddr>, DnsError>;

    /// MX exchange host names, lowest preference first.
    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError>;
}

pub struct TrustDnsResolver {
    resolver: TokioAsyncResolver,
}

impl TrustDnsResolver {
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { resolver }
    }

    fn classify(name: &str, err: ResolveError) -> DnsError {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound(name.to_string()),
            ResolveErrorKind::Timeout => DnsError::Timeout(name.to_string()),
            _ => DnsError::Lookup {
                name: name.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

impl Default for TrustDnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsResolver for TrustDnsResolver {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| Self::classify(name, e))?;

        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part))
                    .collect::<String>()
            })
            .collect())
    }

    async fn ips(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        let lookup = self
            .resolver
            .lookup_ip(name)
            .await
            .map_err(|e| Self::classify(name, e))?;
        Ok(lookup.iter().collect())
    }

    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self
            .resolver
            .mx_lookup(name)
            .await
            .map_err(|e| Self::classify(name, e))?;

        let mut records: Vec<(u16, String)> = lookup
            .iter()
            .map(|mx| {
                (
                    mx.preference(),
                    mx.exchange().to_string().trim_end_matches('.').to_string(),
                )
            })
            .collect();
        records.sort_by_key(|(preference, _)| *preference);
        Ok(records.into_iter().map(|(_, host)| host).collect())
    }
}

/// In-memory zone. Names are matched case-insensitively, trailing dot ignored.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    txt: HashMap<String, Vec<String>>,
    ips: HashMap<String, Vec<IpAddr>>,
    mx: HashMap<String, Vec<String>>,
    failing: HashMap<String, DnsError>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_txt(mut self, name: &str, record: &str) -> Self {
        self.txt.entry(key(name)).or_default().push(record.to_string());
        self
    }

    pub fn with_ip(mut self, name: &str, ip: IpAddr) -> Self {
        self.ips.entry(key(name)).or_default().push(ip);
        self
    }

    pub fn with_mx(mut self, name: &str, host: &str) -> Self {
        self.mx.entry(key(name)).or_default().push(host.to_string());
        self
    }

    /// Every lookup of `name` fails with a non-NXDOMAIN error.
    pub fn with_failure(mut self, name: &str) -> Self {
        self.failing.insert(
            key(name),
            DnsError::Lookup {
                name: name.to_string(),
                reason: "SERVFAIL".to_string(),
            },
        );
        self
    }

    fn answer<T: Clone>(&self, table: &HashMap<String, Vec<T>>, name: &str) -> Result<Vec<T>, DnsError> {
        let name = key(name);
        if let Some(err) = self.failing.get(&name) {
            return Err(err.clone());
        }
        match table.get(&name) {
            Some(records) if !records.is_empty() => Ok(records.clone()),
            _ => Err(DnsError::NotFound(name)),
        }
    }
}

fn key(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

#[async_trait]
impl DnsResolver for StaticResolver {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.answer(&self.txt, name)
    }

    async fn ips(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.answer(&self.ips, name)
    }

    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.answer(&self.mx, name)
    }
}
