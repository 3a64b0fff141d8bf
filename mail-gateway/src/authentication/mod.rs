/// Email authentication (SPF, DKIM, DMARC)
///
/// All three checks resolve DNS through the [`DnsResolver`] trait so they can
/// run against the system resolver or an in-memory zone.
pub mod canonicalize;
pub mod dkim;
pub mod dmarc;
pub mod dns;
pub mod spf;
pub mod types;

pub use dkim::{DkimError, DkimValidator};
pub use dmarc::{DmarcError, DmarcValidator};
pub use dns::{DnsError, DnsResolver, StaticResolver, TrustDnsResolver};
pub use spf::{SpfError, SpfValidator};
pub use types::{DkimVerdict, DmarcPolicy, SpfResult};
