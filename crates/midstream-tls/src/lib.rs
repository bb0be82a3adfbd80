use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use midstream_core::{TlsConfigProvider, TlsProviderError};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

#[derive(Debug)]
pub enum TlsStoreError {
    CertificateGeneration(rcgen::Error),
    ConfigBuild(rustls::Error),
    Io(std::io::Error),
    LockPoisoned,
    InvalidConfiguration(String),
}

impl fmt::Display for TlsStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CertificateGeneration(error) => {
                write!(f, "certificate generation failed: {error}")
            }
            Self::ConfigBuild(error) => write!(f, "TLS config build failed: {error}"),
            Self::Io(error) => write!(f, "I/O error: {error}"),
            Self::LockPoisoned => write!(f, "certificate store lock poisoned"),
            Self::InvalidConfiguration(reason) => write!(f, "invalid TLS configuration: {reason}"),
        }
    }
}

impl StdError for TlsStoreError {}

impl From<rcgen::Error> for TlsStoreError {
    fn from(value: rcgen::Error) -> Self {
        Self::CertificateGeneration(value)
    }
}

impl From<rustls::Error> for TlsStoreError {
    fn from(value: rustls::Error) -> Self {
        Self::ConfigBuild(value)
    }
}

impl From<std::io::Error> for TlsStoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    pub ca_cert_pem_path: Option<PathBuf>,
    pub ca_key_pem_path: Option<PathBuf>,
    pub common_name: String,
    pub organization: String,
    pub leaf_cache_capacity: usize,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            common_name: "midstream Local CA".to_string(),
            organization: "midstream".to_string(),
            leaf_cache_capacity: 1024,
        }
    }
}

impl CaConfig {
    fn validate(&self) -> Result<(), TlsStoreError> {
        match (&self.ca_cert_pem_path, &self.ca_key_pem_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(TlsStoreError::InvalidConfiguration(
                    "ca_cert_pem_path and ca_key_pem_path must be set together".to_string(),
                ));
            }
        }
        if self.common_name.trim().is_empty() {
            return Err(TlsStoreError::InvalidConfiguration(
                "common_name must not be empty".to_string(),
            ));
        }
        if self.organization.trim().is_empty() {
            return Err(TlsStoreError::InvalidConfiguration(
                "organization must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertStoreMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
}

struct StoreState {
    ca: CaMaterial,
    leaf_cache: HashMap<String, Arc<ServerConfig>>,
    cache_order: VecDeque<String>,
}

pub struct LeafCertificateStore {
    config: CaConfig,
    state: Mutex<StoreState>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl LeafCertificateStore {
    pub fn new(config: CaConfig) -> Result<Self, TlsStoreError> {
        config.validate()?;
        let ca = load_or_generate_ca(&config)?;
        Ok(Self {
            config,
            state: Mutex::new(StoreState {
                ca,
                leaf_cache: HashMap::new(),
                cache_order: VecDeque::new(),
            }),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        })
    }

    pub fn server_config_for(&self, host_port: &str) -> Result<Arc<ServerConfig>, TlsStoreError> {
        let host = normalize_host(strip_port(host_port));
        if host.is_empty() {
            return Err(TlsStoreError::InvalidConfiguration(
                "certificate host must not be empty".to_string(),
            ));
        }

        let mut state = self.state.lock().map_err(|_| TlsStoreError::LockPoisoned)?;
        if let Some(cached) = state.leaf_cache.get(&host) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(cached));
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let (server_config, _leaf_der) = issue_leaf_config(&state.ca, &host)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);

        if self.config.leaf_cache_capacity > 0 {
            if state.leaf_cache.len() >= self.config.leaf_cache_capacity {
                if let Some(oldest) = state.cache_order.pop_front() {
                    state.leaf_cache.remove(&oldest);
                }
            }
            state
                .leaf_cache
                .insert(host.clone(), Arc::clone(&server_config));
            state.cache_order.push_back(host);
        }

        Ok(server_config)
    }

    pub fn ca_certificate_pem(&self) -> Result<String, TlsStoreError> {
        let state = self.state.lock().map_err(|_| TlsStoreError::LockPoisoned)?;
        Ok(state.ca.cert_pem.clone())
    }

    pub fn ca_certificate_der(&self) -> Result<CertificateDer<'static>, TlsStoreError> {
        let state = self.state.lock().map_err(|_| TlsStoreError::LockPoisoned)?;
        Ok(state.ca.cert_der.clone())
    }

    pub fn metrics(&self) -> CertStoreMetrics {
        CertStoreMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }
}

impl TlsConfigProvider for LeafCertificateStore {
    fn server_config_for(&self, host_port: &str) -> Result<Arc<ServerConfig>, TlsProviderError> {
        LeafCertificateStore::server_config_for(self, host_port)
            .map_err(|error| TlsProviderError::new(error.to_string()))
    }
}

fn load_or_generate_ca(config: &CaConfig) -> Result<CaMaterial, TlsStoreError> {
    match (&config.ca_cert_pem_path, &config.ca_key_pem_path) {
        (Some(cert_path), Some(key_path)) => match (cert_path.exists(), key_path.exists()) {
            (true, true) => load_ca(cert_path, key_path),
            (false, false) => {
                let generated = generate_ca(config)?;
                persist_ca(cert_path, key_path, &generated)?;
                Ok(generated)
            }
            _ => Err(TlsStoreError::InvalidConfiguration(
                "CA cert and key files must both exist or both be absent".to_string(),
            )),
        },
        _ => generate_ca(config),
    }
}

fn generate_ca(config: &CaConfig) -> Result<CaMaterial, TlsStoreError> {
    let ca_key = KeyPair::generate()?;
    let key_pem = ca_key.serialize_pem();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, config.common_name.clone());
    name.push(DnType::OrganizationName, config.organization.clone());
    params.distinguished_name = name;

    let ca_cert = params.self_signed(&ca_key)?;
    let cert_pem = ca_cert.pem();
    let cert_der = ca_cert.der().clone();
    let issuer = Issuer::new(params, ca_key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn load_ca(cert_path: &Path, key_path: &Path) -> Result<CaMaterial, TlsStoreError> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        TlsStoreError::InvalidConfiguration(format!(
            "failed to parse CA certificate PEM from {}: {error}",
            cert_path.display()
        ))
    })?;
    let ca_key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
        TlsStoreError::InvalidConfiguration(format!(
            "failed to parse issuer metadata from {}: {error}",
            cert_path.display()
        ))
    })?;

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn persist_ca(cert_path: &Path, key_path: &Path, ca: &CaMaterial) -> Result<(), TlsStoreError> {
    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
    }
    fs::write(cert_path, ca.cert_pem.as_bytes())?;
    fs::write(key_path, ca.key_pem.as_bytes())?;
    Ok(())
}

fn issue_leaf_config(
    ca: &CaMaterial,
    host: &str,
) -> Result<(Arc<ServerConfig>, CertificateDer<'static>), TlsStoreError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    let leaf_key = KeyPair::generate()?;
    let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
    let leaf_cert = params.signed_by(&leaf_key, &ca.issuer)?;
    let leaf_der = leaf_cert.der().clone();

    let chain = vec![leaf_der.clone(), ca.cert_der.clone()];
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, PrivateKeyDer::from(leaf_key_der))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok((Arc::new(server_config), leaf_der))
}

fn strip_port(host_port: &str) -> &str {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    match host_port.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => host_port,
    }
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    use super::{strip_port, CaConfig, LeafCertificateStore};

    #[test]
    fn port_stripping_handles_all_authority_forms() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn leaf_cache_hits_return_the_same_config() {
        let store = LeafCertificateStore::new(CaConfig::default()).expect("store");

        let first = store
            .server_config_for("api.example.com:443")
            .expect("first leaf");
        let second = store
            .server_config_for("API.example.com")
            .expect("second leaf");
        assert!(
            Arc::ptr_eq(&first, &second),
            "port and case must not split the cache"
        );

        let metrics = store.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.leaves_issued, 1);
    }

    #[test]
    fn zero_capacity_store_never_caches() {
        let store = LeafCertificateStore::new(CaConfig {
            leaf_cache_capacity: 0,
            ..CaConfig::default()
        })
        .expect("store");

        let first = store.server_config_for("a.example.com").expect("first");
        let second = store.server_config_for("a.example.com").expect("second");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(store.metrics().leaves_issued, 2);
    }

    #[test]
    fn cache_capacity_evicts_oldest_entry() {
        let store = LeafCertificateStore::new(CaConfig {
            leaf_cache_capacity: 1,
            ..CaConfig::default()
        })
        .expect("store");

        let first = store.server_config_for("a.example.com").expect("a");
        let _ = store.server_config_for("b.example.com").expect("b");
        let again = store.server_config_for("a.example.com").expect("a again");
        assert!(!Arc::ptr_eq(&first, &again), "a was evicted by b");
    }

    #[test]
    fn issued_leaf_chains_to_store_ca_and_names_host() {
        let store = LeafCertificateStore::new(CaConfig::default()).expect("store");
        let ca_der = store.ca_certificate_der().expect("ca der");

        let state = store.state.lock().expect("state");
        let (_, leaf_der) =
            super::issue_leaf_config(&state.ca, "leaf.example.com").expect("dns leaf");

        let (_, leaf) = parse_x509_certificate(leaf_der.as_ref()).expect("parse leaf");
        let (_, ca) = parse_x509_certificate(ca_der.as_ref()).expect("parse ca");
        assert!(ca.is_ca(), "store CA must be a CA certificate");
        assert_eq!(leaf.issuer(), ca.subject());

        let cn = leaf
            .subject()
            .iter_common_name()
            .next()
            .expect("commonName")
            .as_str()
            .expect("commonName as utf8");
        assert_eq!(cn, "leaf.example.com");

        let san = leaf
            .subject_alternative_name()
            .expect("san parse")
            .expect("san present");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName(value) if *value == "leaf.example.com")));
    }

    #[test]
    fn ip_hosts_get_ip_subject_alternative_names() {
        let store = LeafCertificateStore::new(CaConfig::default()).expect("store");
        let state = store.state.lock().expect("state");
        let (_, leaf_der) = super::issue_leaf_config(&state.ca, "127.0.0.1").expect("ip leaf");

        let (_, leaf) = parse_x509_certificate(leaf_der.as_ref()).expect("parse leaf");
        let san = leaf
            .subject_alternative_name()
            .expect("san parse")
            .expect("san present");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == [127, 0, 0, 1])));
    }

    #[test]
    fn ca_material_round_trips_through_disk() {
        let dir = unique_temp_dir("midstream-ca");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let cert_path = dir.join("ca-cert.pem");
        let key_path = dir.join("ca-key.pem");

        let config = CaConfig {
            ca_cert_pem_path: Some(cert_path.clone()),
            ca_key_pem_path: Some(key_path.clone()),
            ..CaConfig::default()
        };

        let first = LeafCertificateStore::new(config.clone()).expect("first store");
        let first_ca = first.ca_certificate_pem().expect("first ca");
        drop(first);

        let second = LeafCertificateStore::new(config).expect("second store");
        let second_ca = second.ca_certificate_pem().expect("second ca");
        assert_eq!(first_ca, second_ca);

        std::fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[test]
    fn partial_path_configuration_is_rejected() {
        let error = LeafCertificateStore::new(CaConfig {
            ca_cert_pem_path: Some(PathBuf::from("/tmp/midstream-only-cert.pem")),
            ca_key_pem_path: None,
            ..CaConfig::default()
        })
        .map(|_| ())
        .expect_err("partial CA paths must fail");
        assert!(error.to_string().contains("set together"), "{error}");
    }

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock");
        std::env::temp_dir().join(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            now.as_nanos()
        ))
    }
}
