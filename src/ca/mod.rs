//! Certificate authority for TLS termination.
//!
//! Generates a root CA on first use (optionally persisted to disk) and
//! issues per-host leaf certificates signed by it. Leaves are cached for
//! the lifetime of the process, or until [`CertificateAuthority::reset`].
//!
//! # Example
//!
//! ```no_run
//! use intercept_proxy::ca::{CaStore, CertificateAuthority};
//!
//! let ca = CertificateAuthority::with_store(CaStore::new("/tmp/intercept-proxy-ca"));
//! let root = ca.root_certificate()?;
//! println!("{}", root.cert_pem());
//!
//! let leaf = ca.certificate_for_host("api.example.com")?;
//! # Ok::<(), intercept_proxy::ca::CaError>(())
//! ```

mod authority;
mod error;
mod store;

pub use authority::{
    CertificateAuthority, CertificateEntry, RootCertificate, LEAF_VALIDITY_DAYS,
    ROOT_COMMON_NAME, ROOT_VALIDITY_DAYS,
};
pub(crate) use authority::normalize_hostname;
pub use error::CaError;
pub use store::{CaStore, CERT_FILE, KEY_FILE};
