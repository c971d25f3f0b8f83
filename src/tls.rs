//! 隧道内密钥交换使用的 TLS 配置
//!
//! TLS 只用来认证服务端并把对称密钥安全地送过去，不承载隧道数据

use anyhow::{bail, Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}: {:?}", what, path))?;
    Ok(BufReader::new(file))
}

/// 读取 PEM 文件中的全部证书，文件里没有证书时报错
fn read_certs(path: &Path, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path, what)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse {}: {:?}", what, path))?;
    if certs.is_empty() {
        bail!("No certificate found in {:?}", path);
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path, "key file")?)
        .with_context(|| format!("Failed to parse private key: {:?}", path))?
        .with_context(|| format!("No private key found in {:?}", path))
}

/// 加载服务端配置：证书链与私钥
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = read_certs(cert_path, "cert file")?;
    let key = read_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Certificate and private key do not form a usable server identity")?;
    debug!("Loaded key-exchange certificate from {:?}", cert_path);
    Ok(Arc::new(config))
}

/// 加载客户端配置
///
/// 给出 CA 时只信任该 CA；否则使用系统根证书。`skip_verify` 接受任意证书，
/// 但握手签名仍然校验
pub fn load_client_config(
    ca_cert_path: Option<&Path>,
    skip_verify: bool,
) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = RootCertStore::empty();
    match ca_cert_path {
        Some(path) => {
            for cert in read_certs(path, "CA cert file")? {
                roots.add(cert).context("Failed to add CA certificate")?;
            }
        }
        None if !skip_verify => {
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                warn!("Skipping unreadable system certificate: {}", err);
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!("Loaded {} system root certificates ({} ignored)", added, ignored);
        }
        None => {}
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if skip_verify {
        let provider = config.crypto_provider().clone();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }));
    }

    Ok(Arc::new(config))
}

pub fn connector(config: Arc<rustls::ClientConfig>) -> TlsConnector {
    TlsConnector::from(config)
}

pub fn acceptor(config: Arc<rustls::ServerConfig>) -> TlsAcceptor {
    TlsAcceptor::from(config)
}

/// 解析 TLS 服务器名（域名或 IP）
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string()).with_context(|| format!("Invalid server name: {}", name))
}

/// 生成自签名证书和私钥并写入指定路径
///
/// `common_name` 总会出现在 SAN 中
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    let mut names = vec![common_name.to_string()];
    names.extend(alt_names.iter().filter(|n| *n != common_name).cloned());

    let certified = generate_simple_self_signed(names)
        .context("Failed to generate self-signed certificate")?;

    std::fs::write(cert_out, certified.cert.pem())
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    std::fs::write(key_out, certified.signing_key.serialize_pem())
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;
    Ok(())
}

/// 跳过证书链与主机名验证（仅用于测试），握手签名交给加密后端校验
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
