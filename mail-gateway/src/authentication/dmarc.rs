use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::dns::{DnsError, DnsResolver};
use super::types::DmarcPolicy;

#[derive(Error, Debug)]
pub enum DmarcError {
    #[error("DMARC lookup for {domain} failed: {source}")]
    Lookup {
        domain: String,
        #[source]
        source: DnsError,
    },

    /// The domain publishes `p=reject`
    #[error("DMARC policy is reject for {domain}")]
    Reject { domain: String },
}

impl DmarcError {
    pub fn policy(&self) -> Option<DmarcPolicy> {
        match self {
            DmarcError::Reject { .. } => Some(DmarcPolicy::Reject),
            DmarcError::Lookup { .. } => None,
        }
    }
}

/// DMARC policy lookup at `_dmarc.<domain>`
pub struct DmarcValidator {
    resolver: Arc<dyn DnsResolver>,
}

impl DmarcValidator {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self { resolver }
    }

    /// Fetch the policy for `domain`.
    ///
    /// Lookup failures, including a missing record, are errors. A `v=DMARC1`
    /// record with `p=reject` is reported as [`DmarcError::Reject`].
    pub async fn fetch_policy(&self, domain: &str) -> Result<DmarcPolicy, DmarcError> {
        let name = format!("_dmarc.{}", domain);
        let records = self
            .resolver
            .txt(&name)
            .await
            .map_err(|source| DmarcError::Lookup {
                domain: domain.to_string(),
                source,
            })?;

        for record in &records {
            if record.contains("v=DMARC1") && record.contains("p=reject") {
                debug!(%domain, %record, "DMARC policy is reject");
                return Err(DmarcError::Reject {
                    domain: domain.to_string(),
                });
            }
        }

        Ok(DmarcPolicy::Pass)
    }
}
