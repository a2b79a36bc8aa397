//! On-disk persistence of the root CA.
//!
//! The root is written as two PEM files in a directory owned by the user:
//!
//! - `ca.crt`: the certificate, for the operator to install as trusted
//! - `ca.key`: the private key, mode 0600
//!
//! The directory itself is created with mode 0700. Installing `ca.crt` into
//! an OS trust store is left to the operator.

use super::authority::RootCertificate;
use super::error::CaError;
use rcgen::KeyPair;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Certificate filename inside the store directory.
pub const CERT_FILE: &str = "ca.crt";

/// Private key filename inside the store directory.
pub const KEY_FILE: &str = "ca.key";

/// Directory holding a persisted root CA.
#[derive(Debug, Clone)]
pub struct CaStore {
    dir: PathBuf,
}

impl CaStore {
    /// Create a store rooted at `dir`. Nothing is touched until first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the stored certificate.
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    /// Path of the stored private key.
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Whether both certificate and key are present.
    pub fn exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Load the stored root, or generate and persist a new one.
    ///
    /// An expired stored root is replaced.
    pub fn load_or_generate(&self) -> Result<RootCertificate, CaError> {
        if self.exists() {
            let root = self.load()?;
            if !root.is_expired() {
                info!("Loaded root CA from {:?}", self.dir);
                return Ok(root);
            }
            warn!("Stored root CA in {:?} has expired, regenerating", self.dir);
        }

        let root = RootCertificate::generate()?;
        self.save(&root)?;
        Ok(root)
    }

    /// Load the stored root.
    pub fn load(&self) -> Result<RootCertificate, CaError> {
        let cert_pem = fs::read_to_string(self.cert_path()).map_err(CaError::ReadFile)?;
        let key_pem = fs::read_to_string(self.key_path()).map_err(CaError::ReadFile)?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| self.invalid("no certificate in PEM"))?
            .map_err(|e| self.invalid(format!("bad certificate PEM: {}", e)))?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| self.invalid(format!("bad key PEM: {}", e)))?;

        RootCertificate::from_stored(cert_der, cert_pem, key_pair).map_err(|m| self.invalid(m))
    }

    /// Persist `root` into the store directory.
    pub fn save(&self, root: &RootCertificate) -> Result<(), CaError> {
        fs::create_dir_all(&self.dir).map_err(CaError::WriteFile)?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
            .map_err(CaError::Permissions)?;

        fs::write(self.cert_path(), root.cert_pem()).map_err(CaError::WriteFile)?;
        write_restricted_file(&self.key_path(), &root.key_pem())?;

        debug!("Root CA written to {:?}", self.dir);
        Ok(())
    }

    /// Delete stored material, if any.
    pub fn remove(&self) -> Result<(), CaError> {
        for path in [self.cert_path(), self.key_path()] {
            if path.exists() {
                fs::remove_file(&path).map_err(CaError::WriteFile)?;
            }
        }
        Ok(())
    }

    fn invalid(&self, message: impl Into<String>) -> CaError {
        CaError::InvalidStore {
            path: self.dir.clone(),
            message: message.into(),
        }
    }
}

/// Write a file with restricted permissions (0600).
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(CaError::WriteFile)?;

    file.write_all(content.as_bytes())
        .map_err(CaError::WriteFile)?;

    Ok(())
}
