//! TLS provisioning.
//!
//! The certificate pair lives as PEM files at `<data_dir>/tls/{cert,key}.pem`.
//! On first run a self-signed ECDSA P-256 certificate is generated for the
//! configured host and persisted; later runs reuse it, so clients that pin
//! the certificate hash stay valid across restarts. The same material backs
//! both the HTTPS listener and the QUIC endpoint, and the health endpoint
//! reports the SHA-256 of the leaf certificate's DER bytes.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::info;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};

use crate::error::ServerError;

pub struct TlsMaterial {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    leaf_der: Vec<u8>,
}

impl TlsMaterial {
    /// Loads the PEM pair from `dir`, generating and persisting a
    /// self-signed certificate for `host` when none exists.
    pub fn load_or_generate(dir: &Path, host: &str) -> Result<TlsMaterial, ServerError> {
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");

        if cert_path.exists() && key_path.exists() {
            info!("loaded TLS certificate from {}", dir.display());
            return Self::from_pem_files(&cert_path, &key_path);
        }

        info!(
            "no TLS certificate in {}, generating a self-signed one for {}",
            dir.display(),
            host
        );
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()])
            .map_err(|e| ServerError::Internal(format!("certificate generation failed: {}", e)))?;

        fs::create_dir_all(dir)?;
        fs::write(&cert_path, cert.cert.pem())?;
        fs::write(&key_path, cert.key_pair.serialize_pem())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        info!("saved TLS certificate to {}", dir.display());

        Self::from_pem_files(&cert_path, &key_path)
    }

    fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<TlsMaterial, ServerError> {
        let cert_pem = fs::read(cert_path)?;
        let key_pem = fs::read(key_path)?;

        let cert_chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<Result<_, _>>()
                .map_err(|e| ServerError::Internal(format!("bad certificate file: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(ServerError::Internal(format!(
                "no certificate found in {}",
                cert_path.display()
            )));
        }

        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| ServerError::Internal(format!("bad key file: {}", e)))?
            .ok_or_else(|| {
                ServerError::Internal(format!("no private key found in {}", key_path.display()))
            })?;

        let leaf_der = cert_chain[0].to_vec();
        Ok(TlsMaterial {
            cert_chain,
            key,
            leaf_der,
        })
    }

    /// Server config for the HTTPS/WebSocket listener.
    pub fn http_server_config(&self) -> Result<Arc<rustls::ServerConfig>, ServerError> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| ServerError::Internal(format!("tls config: {}", e)))?;
        Ok(Arc::new(config))
    }

    /// Server config for the QUIC endpoint (ALPN `lockstep`).
    pub fn quic_server_config(&self) -> Result<rustls::ServerConfig, ServerError> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| ServerError::Internal(format!("tls config: {}", e)))?;
        config.alpn_protocols = vec![b"lockstep".to_vec()];
        Ok(config)
    }

    /// Hex SHA-256 of the leaf certificate's DER bytes, for clients that
    /// pin the server certificate.
    pub fn cert_hash_hex(&self) -> String {
        let digest = Sha256::digest(&self.leaf_der);
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}
