//! Certificate authority for the stage daemon
//!
//! Each stage directory holds its own CA. A client leaf lets the host talk to
//! the daemon and a server leaf (with the VM address as SAN) is uploaded to the
//! guest. All keys are 2048-bit RSA signed with SHA-256.

use crate::error::{Result, VirtualBoxError};
use crate::fsutil::write_secret;
use chrono::Utc;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256,
};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

pub const CA_CERT: &str = "ca.pem";
pub const CA_KEY: &str = "ca-key.pem";
pub const CLIENT_CERT: &str = "client.pem";
pub const CLIENT_KEY: &str = "client-key.pem";
pub const SERVER_CERT: &str = "server.pem";
pub const SERVER_KEY: &str = "server-key.pem";

const ORGANIZATION: &str = "dodo";
const RSA_BITS: usize = 2048;
const VALIDITY: Duration = Duration::from_secs(1080 * 24 * 60 * 60);
const CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Files of one CA plus one leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSet {
    pub ca: PathBuf,
    pub ca_key: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertificateSet {
    fn new(dir: &Path, cert: &str, key: &str) -> Self {
        Self {
            ca: dir.join(CA_CERT),
            ca_key: dir.join(CA_KEY),
            cert: dir.join(cert),
            key: dir.join(key),
        }
    }

    pub fn client(dir: &Path) -> Self {
        Self::new(dir, CLIENT_CERT, CLIENT_KEY)
    }

    pub fn server(dir: &Path) -> Self {
        Self::new(dir, SERVER_CERT, SERVER_KEY)
    }

    /// Leaf kind follows the host list: none means a client certificate
    pub fn for_hosts(dir: &Path, hosts: &[String]) -> Self {
        if leaf_hosts(hosts).is_empty() {
            Self::client(dir)
        } else {
            Self::server(dir)
        }
    }

    fn files(&self) -> [&Path; 4] {
        [&self.ca, &self.ca_key, &self.cert, &self.key]
    }
}

fn leaf_hosts(hosts: &[String]) -> Vec<String> {
    hosts
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .map(String::from)
        .collect()
}

fn cert_error(context: &'static str) -> impl Fn(rcgen::Error) -> VirtualBoxError {
    move |e| VirtualBoxError::Certificate(format!("{}: {}", context, e))
}

/// Generate an RSA key usable by rcgen, with its PKCS#8 PEM
fn generate_key() -> Result<(KeyPair, String)> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
        .map_err(|e| VirtualBoxError::Certificate(format!("failed to generate RSA key: {}", e)))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| VirtualBoxError::Certificate(format!("failed to encode RSA key: {}", e)))?;
    let pair = KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256)
        .map_err(cert_error("failed to load RSA key"))?;
    Ok((pair, pem.to_string()))
}

fn validity(params: &mut CertificateParams) {
    let not_before = SystemTime::now() - CLOCK_SKEW;
    params.not_before = not_before.into();
    params.not_after = (not_before + VALIDITY).into();
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Parameters of the stage CA
///
/// Also used to rebuild the issuer when signing leaves; the subject must come
/// out byte-identical to the stored `ca.pem`.
fn ca_params() -> Result<CertificateParams> {
    let mut params =
        CertificateParams::new(Vec::<String>::new()).map_err(cert_error("invalid CA parameters"))?;
    params.distinguished_name = distinguished_name("dodo CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    validity(&mut params);
    Ok(params)
}

fn generate_ca(set: &CertificateSet) -> Result<()> {
    let (key, key_pem) = generate_key()?;
    let cert = ca_params()?
        .self_signed(&key)
        .map_err(cert_error("failed to self-sign CA"))?;

    std::fs::write(&set.ca, cert.pem())?;
    write_secret(&set.ca_key, key_pem.as_bytes())?;
    tracing::debug!(path = %set.ca.display(), "Generated CA certificate");
    Ok(())
}

fn load_issuer(set: &CertificateSet) -> Result<(Certificate, KeyPair)> {
    let key_pem = std::fs::read_to_string(&set.ca_key)?;
    let key = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)
        .map_err(cert_error("failed to load CA key"))?;
    let cert = ca_params()?
        .self_signed(&key)
        .map_err(cert_error("failed to rebuild CA"))?;
    Ok((cert, key))
}

fn generate_leaf(set: &CertificateSet, hosts: &[String]) -> Result<()> {
    let hosts = leaf_hosts(hosts);
    let (issuer, issuer_key) = load_issuer(set)?;

    let mut params = CertificateParams::new(hosts.clone())
        .map_err(cert_error("invalid certificate host"))?;
    if hosts.is_empty() {
        params.distinguished_name = distinguished_name("dodo client");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    } else {
        params.distinguished_name = distinguished_name(&hosts[0]);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    }
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    validity(&mut params);

    let (key, key_pem) = generate_key()?;
    let cert = params
        .signed_by(&key, &issuer, &issuer_key)
        .map_err(cert_error("failed to sign certificate"))?;

    std::fs::write(&set.cert, cert.pem())?;
    write_secret(&set.key, key_pem.as_bytes())?;
    tracing::debug!(path = %set.cert.display(), hosts = ?hosts, "Generated leaf certificate");
    Ok(())
}

/// Seconds since the epoch after which the certificate in `path` is invalid
fn not_after(path: &Path) -> Option<i64> {
    let content = std::fs::read(path).ok()?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&content).ok()?;
    let cert = pem.parse_x509().ok()?;
    Some(cert.validity().not_after.timestamp())
}

fn key_is_readable(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .is_some_and(|pem| RsaPrivateKey::from_pkcs8_pem(&pem).is_ok())
}

/// Why the set has to be regenerated, `None` when it is usable
fn stale_reason(set: &CertificateSet) -> Option<String> {
    if let Some(missing) = set.files().into_iter().find(|path| !path.exists()) {
        return Some(format!("{} is missing", missing.display()));
    }

    let now = Utc::now().timestamp();
    for cert in [&set.ca, &set.cert] {
        match not_after(cert) {
            None => return Some(format!("{} is unreadable", cert.display())),
            Some(expiry) if expiry <= now => {
                return Some(format!("{} has expired", cert.display()));
            }
            Some(_) => {}
        }
    }

    for key in [&set.ca_key, &set.key] {
        if !key_is_readable(key) {
            return Some(format!("{} is unreadable", key.display()));
        }
    }

    None
}

/// Make sure `dir` holds a current CA and leaf certificate
///
/// With no hosts the leaf is a client certificate (`client.pem`), otherwise a
/// server certificate naming every host (`server.pem`). When any file is
/// missing, unreadable or expired, both CA and leaf are regenerated. Returns
/// whether regeneration happened.
pub fn bootstrap_certificates(dir: &Path, hosts: &[String]) -> Result<bool> {
    let set = CertificateSet::for_hosts(dir, hosts);

    let Some(reason) = stale_reason(&set) else {
        tracing::debug!(dir = %dir.display(), "Certificates are current");
        return Ok(false);
    };

    tracing::info!(reason = %reason, "Generating certificates");
    std::fs::create_dir_all(dir)?;
    generate_ca(&set)?;
    generate_leaf(&set, hosts)?;
    Ok(true)
}

/// Sign a server certificate for `hosts` with the CA already in `dir`
pub fn generate_server_certificate(dir: &Path, hosts: &[String]) -> Result<CertificateSet> {
    if leaf_hosts(hosts).is_empty() {
        return Err(VirtualBoxError::Certificate(
            "a server certificate needs at least one host".to_string(),
        ));
    }

    let set = CertificateSet::server(dir);
    generate_leaf(&set, hosts)?;
    Ok(set)
}

fn tls_error(context: &str, err: impl std::fmt::Display) -> VirtualBoxError {
    VirtualBoxError::Tls(format!("{}: {}", context, err))
}

fn client_config(set: &CertificateSet) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(&set.ca).map_err(|e| tls_error("reading CA", e))? {
        let cert = cert.map_err(|e| tls_error("reading CA", e))?;
        roots
            .add(cert)
            .map_err(|e| tls_error("trusting CA", e))?;
    }

    let chain = CertificateDer::pem_file_iter(&set.cert)
        .map_err(|e| tls_error("reading client certificate", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error("reading client certificate", e))?;
    let key = PrivateKeyDer::from_pem_file(&set.key)
        .map_err(|e| tls_error("reading client key", e))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("configuring TLS", e))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| tls_error("configuring client certificate", e))
}

/// Mutual-TLS handshake against `addr` (`host:port`) with the client
/// certificate stored in `dir`
///
/// Succeeds when the daemon is listening and trusts our CA; nothing is sent.
pub async fn validate_certificate(addr: &str, dir: &Path) -> Result<()> {
    let config = client_config(&CertificateSet::client(dir))?;
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| tls_error("invalid server name", e))?;

    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| VirtualBoxError::Tls(format!("connecting to {} timed out", addr)))??;

    let connector = TlsConnector::from(Arc::new(config));
    let mut tls = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, stream))
        .await
        .map_err(|_| VirtualBoxError::Tls(format!("TLS handshake with {} timed out", addr)))?
        .map_err(|e| tls_error("handshake failed", e))?;

    let _ = tls.shutdown().await;
    tracing::debug!(addr, "TLS handshake succeeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_bootstrap_twice_keeps_certificates() {
        let dir = tempfile::tempdir().unwrap();

        assert!(bootstrap_certificates(dir.path(), &[]).unwrap());
        let ca = std::fs::read(dir.path().join(CA_CERT)).unwrap();
        let client = std::fs::read(dir.path().join(CLIENT_CERT)).unwrap();

        assert!(!bootstrap_certificates(dir.path(), &[]).unwrap());
        assert_eq!(std::fs::read(dir.path().join(CA_CERT)).unwrap(), ca);
        assert_eq!(std::fs::read(dir.path().join(CLIENT_CERT)).unwrap(), client);
    }

    #[test]
    fn test_expired_leaf_regenerates_ca_and_leaf() {
        let dir = tempfile::tempdir().unwrap();
        bootstrap_certificates(dir.path(), &[]).unwrap();
        let ca = std::fs::read(dir.path().join(CA_CERT)).unwrap();

        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.not_before = (SystemTime::now() - Duration::from_secs(7200)).into();
        params.not_after = (SystemTime::now() - Duration::from_secs(3600)).into();
        let expired = params.self_signed(&KeyPair::generate().unwrap()).unwrap();
        std::fs::write(dir.path().join(CLIENT_CERT), expired.pem()).unwrap();

        assert!(bootstrap_certificates(dir.path(), &[]).unwrap());
        assert_ne!(std::fs::read(dir.path().join(CA_CERT)).unwrap(), ca);
        assert!(not_after(&dir.path().join(CLIENT_CERT)).unwrap() > Utc::now().timestamp());
    }

    #[test]
    fn test_missing_key_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        bootstrap_certificates(dir.path(), &[]).unwrap();
        std::fs::remove_file(dir.path().join(CLIENT_KEY)).unwrap();

        assert!(bootstrap_certificates(dir.path(), &[]).unwrap());
        assert!(dir.path().join(CLIENT_KEY).exists());
    }

    #[test]
    fn test_leaf_kind_follows_hosts() {
        let dir = Path::new("/stages/dev");
        assert_eq!(CertificateSet::for_hosts(dir, &[]).cert, dir.join(CLIENT_CERT));
        assert_eq!(
            CertificateSet::for_hosts(dir, &[" ".to_string()]).cert,
            dir.join(CLIENT_CERT)
        );
        assert_eq!(
            CertificateSet::for_hosts(dir, &["192.168.99.100".to_string()]).cert,
            dir.join(SERVER_CERT)
        );
    }

    #[tokio::test]
    async fn test_validate_against_mutual_tls_listener() {
        let dir = tempfile::tempdir().unwrap();
        bootstrap_certificates(dir.path(), &[]).unwrap();
        let server = generate_server_certificate(dir.path(), &["127.0.0.1".to_string()]).unwrap();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = rustls::RootCertStore::empty();
        for cert in CertificateDer::pem_file_iter(&server.ca).unwrap() {
            roots.add(cert.unwrap()).unwrap();
        }
        let verifier =
            rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .unwrap();
        let chain = CertificateDer::pem_file_iter(&server.cert)
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        let key = PrivateKeyDer::from_pem_file(&server.key).unwrap();
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            if let Ok(mut tls) = acceptor.accept(stream).await {
                let mut buf = [0u8; 1];
                let _ = tls.read(&mut buf).await;
            }
        });

        validate_certificate(&addr.to_string(), dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_fails_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        bootstrap_certificates(dir.path(), &[]).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(validate_certificate(&addr.to_string(), dir.path()).await.is_err());
    }
}
