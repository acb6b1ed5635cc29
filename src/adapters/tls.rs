//! Assembles the rustls server configuration from PEM files on disk.
use std::{fs::File, io::BufReader};

use eyre::{Context, Result, eyre};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};

use crate::config::SslConfig;

/// Build a rustls `ServerConfig` from the configured certificate chain,
/// private key and optional extra chain files.
pub fn build_server_config(ssl: &SslConfig) -> Result<ServerConfig> {
    let cert_file = &mut BufReader::new(
        File::open(&ssl.cert).with_context(|| format!("failed to open cert file {}", ssl.cert))?,
    );
    let mut cert_chain = certs(cert_file)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates from {}", ssl.cert))?;

    for ca_path in &ssl.ca {
        let ca_file = &mut BufReader::new(
            File::open(ca_path).with_context(|| format!("failed to open CA file {ca_path}"))?,
        );
        let ca_certs = certs(ca_file)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to parse certificates from {ca_path}"))?;
        cert_chain.extend(ca_certs);
    }

    if cert_chain.is_empty() {
        return Err(eyre!("no certificates found in {}", ssl.cert));
    }

    let key_file = &mut BufReader::new(
        File::open(&ssl.key).with_context(|| format!("failed to open key file {}", ssl.key))?,
    );
    let key = pkcs8_private_keys(key_file)
        .next()
        .transpose()
        .with_context(|| format!("failed to parse private key from {}", ssl.key))?
        .ok_or_else(|| eyre!("no PKCS#8 private key found in {}", ssl.key))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .context("failed to build TLS server config")?;

    Ok(config)
}
