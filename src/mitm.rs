//! Certificate forging for the intercepting proxy.
//!
//! The operator provisions a CA the client machines trust; for every
//! intercepted host we mint a short leaf certificate signed by that CA and
//! hand rustls a server config built around it. Forged configs are cached
//! per host since clients reconnect to the same few registries constantly.

use crate::errors::ProxyError;
use rcgen::{Certificate, CertificateParams, DnType, KeyPair};
use rustls::{NoClientAuth, ServerConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct CertAuthority {
    ca: Certificate,
    configs: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertAuthority {
    /// Builds the authority from PEM-encoded CA certificate and key
    /// material (`./ca.crt` / `./ca.key` at boot).
    pub fn load(cert_pem: &str, key_pem: &str) -> Result<Self, ProxyError> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key)?;
        let ca = Certificate::from_params(params)?;
        Ok(Self {
            ca,
            configs: Mutex::new(HashMap::new()),
        })
    }

    /// A rustls server config presenting a leaf certificate for `host`,
    /// signed by the loaded CA.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, ProxyError> {
        if let Some(config) = self.configs.lock().unwrap().get(host) {
            return Ok(config.clone());
        }

        let mut params = CertificateParams::new(vec![host.to_string()]);
        params.distinguished_name.push(DnType::CommonName, host);
        let leaf = Certificate::from_params(params)?;
        let chain = vec![rustls::Certificate(
            leaf.serialize_der_with_signer(&self.ca)?,
        )];
        let key = rustls::PrivateKey(leaf.serialize_private_key_der());

        let mut config = ServerConfig::new(NoClientAuth::new());
        config.set_single_cert(chain, key)?;
        // The proxy only speaks HTTP/1.1 on the decrypted stream.
        config.set_protocols(&[b"http/1.1".to_vec()]);

        let config = Arc::new(config);
        self.configs
            .lock()
            .unwrap()
            .insert(host.to_string(), config.clone());
        Ok(config)
    }
}
