//! TLS connector construction for cluster connections.

use crate::config::TlsOptions;
use crate::error::CommError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Creates a TLS connector and the SNI name to present when dialing
/// `server_host`.
pub fn create_tls_connector(
    options: &TlsOptions,
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), CommError> {
    let root_store = match &options.ca_cert_path {
        Some(ca_path) => {
            let mut store = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                store
                    .add(cert)
                    .map_err(|e| CommError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }
            store
        }
        None => {
            let mut store = RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            store
        }
    };

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

    let client_config = match (&options.client_cert_path, &options.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| CommError::TlsConfig(format!("invalid client cert/key: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    let name = options.server_name.as_deref().unwrap_or(server_host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| CommError::TlsConfig(format!("invalid server name: {}", name)))?;

    Ok((TlsConnector::from(Arc::new(client_config)), server_name))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CommError> {
    let file = File::open(path)
        .map_err(|e| CommError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CommError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(CommError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CommError> {
    let file = File::open(path)
        .map_err(|e| CommError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| CommError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(CommError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}
