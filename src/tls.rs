//! TLS 证书加载，缺省时生成自签名证书。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

/// 加载给定的 PEM 证书与私钥，或为 `host` 生成自签名证书。
pub async fn build_rustls_config(
    cert: Option<&str>,
    key: Option<&str>,
    host: IpAddr,
) -> io::Result<RustlsConfig> {
    let (cert_path, key_path) = match (cert, key) {
        (Some(cert), Some(key)) => (PathBuf::from(cert), PathBuf::from(key)),
        (None, None) => generate_self_signed_paths(host)?,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "--tls-cert and --tls-key must be given together",
            ));
        }
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await
}

fn generate_self_signed_paths(host: IpAddr) -> io::Result<(PathBuf, PathBuf)> {
    let cert = generate_simple_self_signed([host.to_string(), "localhost".to_string()])
        .map_err(io::Error::other)?;
    let cert_path = std::env::temp_dir().join("axo-index-cert.pem");
    let key_path = std::env::temp_dir().join("axo-index-key.pem");
    std::fs::write(&cert_path, cert.cert.pem())?;
    std::fs::write(&key_path, cert.key_pair.serialize_pem())?;
    info!(cert = %cert_path.display(), "generated self-signed certificate");
    Ok((cert_path, key_path))
}
