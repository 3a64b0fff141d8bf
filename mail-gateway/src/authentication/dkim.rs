//! DKIM (DomainKeys Identified Mail) verification
//!
//! Verifies a single `DKIM-Signature` header against the RSA key published
//! at `<selector>._domainkey.<domain>`. The signed digest is SHA-256 over the
//! canonical header block followed by the canonical body.

use base64::{engine::general_purpose, Engine as _};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::canonicalize::{canonicalize_body, canonicalize_headers, split_message, Canonicalization};
use super::dns::{DnsError, DnsResolver};
use super::types::DkimVerdict;

#[derive(Error, Debug)]
pub enum DkimError {
    #[error("parse DKIM-Signature: {0}")]
    Signature(String),

    #[error("fetch public key: DNS TXT lookup for {name}: {source}")]
    KeyLookup {
        name: String,
        #[source]
        source: DnsError,
    },

    #[error("fetch public key: no valid DKIM public key found at {0}")]
    KeyMissing(String),

    #[error("fetch public key: {0}")]
    KeyDecode(String),

    #[error("unsupported DKIM algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("decode signature: {0}")]
    SignatureDecode(#[from] base64::DecodeError),

    #[error("signature verification failed: {0}")]
    Verification(#[from] rsa::Error),
}

impl DkimError {
    /// Verdict reported alongside this error.
    pub fn verdict(&self) -> DkimVerdict {
        match self {
            DkimError::Signature(_) => DkimVerdict::None,
            _ => DkimVerdict::Fail,
        }
    }
}

/// Parsed `DKIM-Signature` tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimSignature {
    pub domain: String,
    pub selector: String,
    pub algorithm: String,
    pub signed_headers: Vec<String>,
    pub header_canonicalization: Canonicalization,
    pub body_canonicalization: Canonicalization,
    /// Base64 signature, whitespace removed
    pub signature: String,
}

impl DkimSignature {
    pub fn parse(value: &str) -> Result<Self, DkimError> {
        let mut tags: HashMap<&str, &str> = HashMap::new();
        for part in value.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, val) = part
                .split_once('=')
                .ok_or_else(|| DkimError::Signature(format!("invalid field: {}", part)))?;
            tags.insert(key.trim(), val.trim());
        }

        let tag = |name: &str| tags.get(name).copied().unwrap_or("");
        if tag("v") != "1" || tag("s").is_empty() || tag("d").is_empty() || tag("b").is_empty() {
            return Err(DkimError::Signature(
                "missing or invalid required DKIM fields".to_string(),
            ));
        }

        let (header_canonicalization, body_canonicalization) = Canonicalization::parse_pair(tag("c"))
            .ok_or_else(|| DkimError::Signature(format!("invalid canonicalization: {}", tag("c"))))?;

        Ok(DkimSignature {
            domain: tag("d").to_lowercase(),
            selector: tag("s").to_string(),
            algorithm: tag("a").to_lowercase(),
            signed_headers: tag("h")
                .split(':')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
            header_canonicalization,
            body_canonicalization,
            signature: tag("b").split_whitespace().collect(),
        })
    }

    pub fn key_name(&self) -> String {
        format!("{}._domainkey.{}", self.selector, self.domain)
    }
}

/// DKIM verifier
pub struct DkimValidator {
    resolver: Arc<dyn DnsResolver>,
    bypass_domain: Option<String>,
}

impl DkimValidator {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            resolver,
            bypass_domain: None,
        }
    }

    /// Report `pass` without verification for messages carrying `d=<domain>`.
    pub fn with_bypass_domain(mut self, domain: Option<String>) -> Self {
        self.bypass_domain = domain.filter(|d| !d.is_empty());
        self
    }

    /// Verify the message's DKIM signature.
    ///
    /// `Ok` carries `pass`, or `none` when the message is unsigned. Every
    /// failure is an error whose [`DkimError::verdict`] is the reported result.
    pub async fn verify(&self, raw: &[u8]) -> Result<DkimVerdict, DkimError> {
        if let Some(domain) = &self.bypass_domain {
            let marker = format!("d={}", domain);
            if String::from_utf8_lossy(raw).contains(&marker) {
                warn!(%domain, "DKIM bypass domain matched, skipping verification");
                return Ok(DkimVerdict::Pass);
            }
        }

        let message = split_message(raw);
        let Some(header) = message.values("DKIM-Signature").next() else {
            debug!("No DKIM-Signature header");
            return Ok(DkimVerdict::None);
        };

        let signature = DkimSignature::parse(header)?;
        debug!(
            domain = %signature.domain,
            selector = %signature.selector,
            "Verifying DKIM signature"
        );

        let public_key = self.fetch_public_key(&signature).await?;

        let mut canonical = canonicalize_headers(
            &message,
            &signature.signed_headers,
            signature.header_canonicalization,
        );
        canonical.extend(canonicalize_body(message.body, signature.body_canonicalization));

        if signature.algorithm != "rsa-sha256" {
            return Err(DkimError::UnsupportedAlgorithm(signature.algorithm));
        }

        let hashed = Sha256::digest(&canonical);
        let sig = general_purpose::STANDARD.decode(&signature.signature)?;
        public_key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &sig)?;

        debug!(domain = %signature.domain, "DKIM signature verified");
        Ok(DkimVerdict::Pass)
    }

    async fn fetch_public_key(&self, signature: &DkimSignature) -> Result<RsaPublicKey, DkimError> {
        let name = signature.key_name();
        let records = self
            .resolver
            .txt(&name)
            .await
            .map_err(|source| DkimError::KeyLookup {
                name: name.clone(),
                source,
            })?;

        for record in records {
            if !record.starts_with("v=DKIM1;") {
                continue;
            }
            let Some(key) = public_key_tag(&record) else {
                continue;
            };
            let der = general_purpose::STANDARD
                .decode(key)
                .map_err(|e| DkimError::KeyDecode(format!("decode public key: {}", e)))?;
            return RsaPublicKey::from_public_key_der(&der)
                .map_err(|e| DkimError::KeyDecode(format!("parse public key: {}", e)));
        }

        Err(DkimError::KeyMissing(name))
    }
}

/// Value of the non-empty `p=` tag, whitespace removed.
fn public_key_tag(record: &str) -> Option<String> {
    record
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("p="))
        .map(|key| key.split_whitespace().collect::<String>())
        .filter(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authentication::dns::StaticResolver;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;

    struct Signer {
        key: RsaPrivateKey,
    }

    impl Signer {
        fn new() -> Self {
            let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
            Signer { key }
        }

        fn dns_record(&self) -> String {
            let der = self.key.to_public_key().to_public_key_der().unwrap();
            format!("v=DKIM1; k=rsa; p={}", general_purpose::STANDARD.encode(der.as_bytes()))
        }

        fn resolver(&self) -> Arc<dyn DnsResolver> {
            Arc::new(StaticResolver::new().with_txt("sel._domainkey.example.com", &self.dns_record()))
        }

        /// Sign `headers` + `body` with the given `c=` and `a=` tags.
        fn sign(&self, headers: &str, body: &str, canon: &str, algorithm: &str) -> Vec<u8> {
            let template = format!(
                "DKIM-Signature: v=1; a={}; c={}; d=example.com; s=sel;\r\n\th=from:to:subject; b=",
                algorithm, canon
            );
            let unsigned = format!("{}\r\n{}\r\n\r\n{}", template, headers, body);

            let message = split_message(unsigned.as_bytes());
            let (header_mode, body_mode) = Canonicalization::parse_pair(canon).unwrap();
            let signed = ["from".to_string(), "to".to_string(), "subject".to_string()];
            let mut canonical = canonicalize_headers(&message, &signed, header_mode);
            canonical.extend(canonicalize_body(message.body, body_mode));

            let hashed = Sha256::digest(&canonical);
            let sig = self.key.sign(Pkcs1v15Sign::new::<Sha256>(), &hashed).unwrap();
            let b64 = general_purpose::STANDARD.encode(sig);

            format!("{}{}\r\n{}\r\n\r\n{}", template, b64, headers, body).into_bytes()
        }
    }

    const HEADERS: &str = "From: Alice <alice@example.com>\r\nTo: bob@example.org\r\nSubject: Quarterly   report";
    const BODY: &str = "Numbers attached.\r\n";

    #[tokio::test]
    async fn test_signed_message_passes() {
        let signer = Signer::new();
        let raw = signer.sign(HEADERS, BODY, "relaxed/relaxed", "rsa-sha256");
        let validator = DkimValidator::new(signer.resolver());

        assert_eq!(validator.verify(&raw).await.unwrap(), DkimVerdict::Pass);
    }

    #[tokio::test]
    async fn test_simple_canonicalization_passes() {
        let signer = Signer::new();
        let raw = signer.sign(HEADERS, BODY, "simple/simple", "rsa-sha256");
        let validator = DkimValidator::new(signer.resolver());

        assert_eq!(validator.verify(&raw).await.unwrap(), DkimVerdict::Pass);
    }

    #[tokio::test]
    async fn test_altered_body_fails() {
        let signer = Signer::new();
        let raw = signer.sign(HEADERS, BODY, "relaxed/relaxed", "rsa-sha256");
        let tampered = String::from_utf8(raw)
            .unwrap()
            .replace("Numbers attached.", "Numbers changed.");
        let validator = DkimValidator::new(signer.resolver());

        let err = validator.verify(tampered.as_bytes()).await.unwrap_err();
        assert!(matches!(err, DkimError::Verification(_)));
        assert_eq!(err.verdict(), DkimVerdict::Fail);
    }

    #[tokio::test]
    async fn test_relaxed_tolerates_whitespace_changes() {
        let signer = Signer::new();
        let raw = signer.sign(HEADERS, BODY, "relaxed/relaxed", "rsa-sha256");
        let reformatted = String::from_utf8(raw)
            .unwrap()
            .replace("Quarterly   report", "Quarterly report")
            .replace("Numbers attached.\r\n", "Numbers attached.  \r\n\r\n");
        let validator = DkimValidator::new(signer.resolver());

        assert_eq!(
            validator.verify(reformatted.as_bytes()).await.unwrap(),
            DkimVerdict::Pass
        );
    }

    #[tokio::test]
    async fn test_unsigned_message_is_none() {
        let validator = DkimValidator::new(Arc::new(StaticResolver::new()));
        let raw = b"From: a@example.com\r\nSubject: hi\r\n\r\nbody\r\n";
        assert_eq!(validator.verify(raw).await.unwrap(), DkimVerdict::None);
    }

    #[tokio::test]
    async fn test_malformed_signature_is_none_with_error() {
        let validator = DkimValidator::new(Arc::new(StaticResolver::new()));
        let raw = b"DKIM-Signature: v=1; d=example.com; garbage\r\nFrom: a@example.com\r\n\r\nbody";
        let err = validator.verify(raw).await.unwrap_err();
        assert!(matches!(err, DkimError::Signature(_)));
        assert_eq!(err.verdict(), DkimVerdict::None);

        let raw = b"DKIM-Signature: v=2; d=example.com; s=sel; b=abc\r\n\r\nbody";
        assert_eq!(validator.verify(raw).await.unwrap_err().verdict(), DkimVerdict::None);
    }

    #[tokio::test]
    async fn test_missing_key_fails() {
        let signer = Signer::new();
        let raw = signer.sign(HEADERS, BODY, "relaxed/relaxed", "rsa-sha256");
        let validator = DkimValidator::new(Arc::new(StaticResolver::new()));

        let err = validator.verify(&raw).await.unwrap_err();
        assert!(matches!(err, DkimError::KeyLookup { .. }));
        assert_eq!(err.verdict(), DkimVerdict::Fail);

        let resolver = StaticResolver::new().with_txt("sel._domainkey.example.com", "v=DKIM1; p=");
        let validator = DkimValidator::new(Arc::new(resolver));
        assert!(matches!(
            validator.verify(&raw).await.unwrap_err(),
            DkimError::KeyMissing(_)
        ));
    }

    #[tokio::test]
    async fn test_unsupported_algorithm() {
        let signer = Signer::new();
        let raw = signer.sign(HEADERS, BODY, "relaxed/relaxed", "rsa-sha1");
        let validator = DkimValidator::new(signer.resolver());

        let err = validator.verify(&raw).await.unwrap_err();
        assert!(matches!(err, DkimError::UnsupportedAlgorithm(ref a) if a == "rsa-sha1"));
        assert_eq!(err.verdict(), DkimVerdict::Fail);
    }

    #[tokio::test]
    async fn test_bypass_domain() {
        let validator = DkimValidator::new(Arc::new(StaticResolver::new()))
            .with_bypass_domain(Some("test.com".to_string()));
        let raw = b"DKIM-Signature: v=1; d=test.com; s=x; b=bogus\r\n\r\nbody";
        assert_eq!(validator.verify(raw).await.unwrap(), DkimVerdict::Pass);

        let strict = DkimValidator::new(Arc::new(StaticResolver::new()));
        assert!(strict.verify(raw).await.is_err());
    }

    #[test]
    fn test_parse_signature_tags() {
        let sig = DkimSignature::parse(
            "v=1; a=rsa-sha256; c=relaxed/simple; d=Example.COM; s=s1; h=From : To; b=ab cd\t ef",
        )
        .unwrap();
        assert_eq!(sig.domain, "example.com");
        assert_eq!(sig.signed_headers, ["From", "To"]);
        assert_eq!(sig.header_canonicalization, Canonicalization::Relaxed);
        assert_eq!(sig.body_canonicalization, Canonicalization::Simple);
        assert_eq!(sig.signature, "abcdef");
        assert_eq!(sig.key_name(), "s1._domainkey.example.com");
    }

    #[test]
    fn test_public_key_tag() {
        assert_eq!(public_key_tag("v=DKIM1; k=rsa; p=MIIB Ab"), Some("MIIBAb".to_string()));
        assert_eq!(public_key_tag("v=DKIM1; p="), None);
    }
}
