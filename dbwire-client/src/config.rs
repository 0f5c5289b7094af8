//! Communication configuration.
//!
//! A [`CommunicationConfig`] is only produced by
//! [`CommunicationConfigBuilder::build`], which validates the options as a
//! group. File based configuration is layered as follows (later overrides
//! earlier):
//! 1. Default values
//! 2. YAML config file (if specified via DBWIRE_CONFIG or `--config`)
//! 3. Environment variables

use crate::error::CommError;
use dbwire_protocol::{
    ContentType, Credential, HostDescription, DEFAULT_MAX_CHUNK_CONTENT, FIRST_CHUNK_HEADER_SIZE,
    MAX_CHUNK_LENGTH,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default administrative database.
pub const DEFAULT_ADMIN_DATABASE: &str = "_system";

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_HOST_LIST_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 1;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 128;

/// How requests are spread over the known hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Stick to the first known host while it remains in the topology.
    #[default]
    None,
    /// Rotate across all hosts.
    RoundRobin,
    /// Stick to one randomly chosen host while it remains in the topology.
    OneRandom,
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancingStrategy::None => write!(f, "none"),
            LoadBalancingStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalancingStrategy::OneRandom => write!(f, "one_random"),
        }
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "none" => Ok(LoadBalancingStrategy::None),
            "round_robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "one_random" => Ok(LoadBalancingStrategy::OneRandom),
            other => Err(format!("unknown load balancing strategy {other:?}")),
        }
    }
}

/// TLS options for cluster connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Server name for SNI (defaults to the host being dialed).
    pub server_name: Option<String>,
}

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err("client certificate and key must be configured together".to_string());
        }
        Ok(())
    }
}

/// Validated, immutable communication configuration.
#[derive(Debug, Clone)]
pub struct CommunicationConfig {
    hosts: Vec<HostDescription>,
    admin_database: String,
    credential: Option<Credential>,
    acquire_timeout: Duration,
    connect_timeout: Duration,
    idle_ttl: Duration,
    max_chunk_content: usize,
    refresh_host_list: bool,
    host_list_refresh_interval: Duration,
    load_balancing: LoadBalancingStrategy,
    content_type: ContentType,
    max_connections_per_host: usize,
    max_in_flight: usize,
    tls: Option<TlsOptions>,
}

impl CommunicationConfig {
    pub fn builder() -> CommunicationConfigBuilder {
        CommunicationConfigBuilder::default()
    }

    /// Initial hosts, duplicates removed, in configuration order.
    pub fn hosts(&self) -> &[HostDescription] {
        &self.hosts
    }

    pub fn admin_database(&self) -> &str {
        &self.admin_database
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Upper bound for obtaining a connection from a host pool.
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Idle connections are closed once unused for this long.
    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    pub fn max_chunk_content(&self) -> usize {
        self.max_chunk_content
    }

    pub fn refresh_host_list(&self) -> bool {
        self.refresh_host_list
    }

    pub fn host_list_refresh_interval(&self) -> Duration {
        self.host_list_refresh_interval
    }

    pub fn load_balancing(&self) -> LoadBalancingStrategy {
        self.load_balancing
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn max_connections_per_host(&self) -> usize {
        self.max_connections_per_host
    }

    /// Concurrent leases one connection accepts before the pool opens another.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn tls(&self) -> Option<&TlsOptions> {
        self.tls.as_ref()
    }
}

/// Builder for [`CommunicationConfig`].
#[derive(Debug, Clone)]
pub struct CommunicationConfigBuilder {
    hosts: Vec<HostDescription>,
    admin_database: String,
    credential: Option<Credential>,
    acquire_timeout: Duration,
    connect_timeout: Duration,
    idle_ttl: Duration,
    max_chunk_content: usize,
    refresh_host_list: bool,
    host_list_refresh_interval: Duration,
    load_balancing: LoadBalancingStrategy,
    content_type: ContentType,
    max_connections_per_host: usize,
    max_in_flight: usize,
    tls: Option<TlsOptions>,
}

impl Default for CommunicationConfigBuilder {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            admin_database: DEFAULT_ADMIN_DATABASE.to_string(),
            credential: None,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_ttl: DEFAULT_IDLE_TTL,
            max_chunk_content: DEFAULT_MAX_CHUNK_CONTENT,
            refresh_host_list: false,
            host_list_refresh_interval: DEFAULT_HOST_LIST_REFRESH_INTERVAL,
            load_balancing: LoadBalancingStrategy::default(),
            content_type: ContentType::default(),
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            tls: None,
        }
    }
}

impl CommunicationConfigBuilder {
    pub fn host(mut self, host: HostDescription) -> Self {
        self.hosts.push(host);
        self
    }

    pub fn hosts(mut self, hosts: impl IntoIterator<Item = HostDescription>) -> Self {
        self.hosts.extend(hosts);
        self
    }

    pub fn admin_database(mut self, name: impl Into<String>) -> Self {
        self.admin_database = name.into();
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn max_chunk_content(mut self, size: usize) -> Self {
        self.max_chunk_content = size;
        self
    }

    pub fn refresh_host_list(mut self, enabled: bool) -> Self {
        self.refresh_host_list = enabled;
        self
    }

    pub fn host_list_refresh_interval(mut self, interval: Duration) -> Self {
        self.host_list_refresh_interval = interval;
        self
    }

    pub fn load_balancing(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing = strategy;
        self
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.max_connections_per_host = max;
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Validates all options together and produces the configuration.
    pub fn build(self) -> Result<CommunicationConfig, CommError> {
        self.validate().map_err(CommError::ConfigValidation)?;

        let mut hosts: Vec<HostDescription> = Vec::with_capacity(self.hosts.len());
        for host in self.hosts {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }

        Ok(CommunicationConfig {
            hosts,
            admin_database: self.admin_database,
            credential: self.credential,
            acquire_timeout: self.acquire_timeout,
            connect_timeout: self.connect_timeout,
            idle_ttl: self.idle_ttl,
            max_chunk_content: self.max_chunk_content,
            refresh_host_list: self.refresh_host_list,
            host_list_refresh_interval: self.host_list_refresh_interval,
            load_balancing: self.load_balancing,
            content_type: self.content_type,
            max_connections_per_host: self.max_connections_per_host,
            max_in_flight: self.max_in_flight,
            tls: self.tls,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.hosts.is_empty() {
            return Err("at least one host must be configured".to_string());
        }
        if self.admin_database.is_empty() {
            return Err("admin database name must not be empty".to_string());
        }
        if self.acquire_timeout.is_zero() {
            return Err("acquire timeout must be positive".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect timeout must be positive".to_string());
        }
        if self.acquire_timeout >= self.host_list_refresh_interval {
            return Err(format!(
                "acquire timeout ({:?}) must be shorter than the host list refresh interval ({:?})",
                self.acquire_timeout, self.host_list_refresh_interval
            ));
        }

        let max_content = MAX_CHUNK_LENGTH as usize - FIRST_CHUNK_HEADER_SIZE;
        if self.max_chunk_content == 0 || self.max_chunk_content > max_content {
            return Err(format!(
                "max chunk content must be between 1 and {} bytes, got {}",
                max_content, self.max_chunk_content
            ));
        }
        if self.max_connections_per_host == 0 {
            return Err("max connections per host must be at least 1".to_string());
        }
        if self.max_in_flight == 0 {
            return Err("max in-flight requests per connection must be at least 1".to_string());
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}

/// Credential section of a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub user: Option<String>,
    pub password: Option<String>,
    /// Takes precedence over user/password when set.
    pub jwt: Option<String>,
}

impl AuthSection {
    fn credential(&self) -> Option<Credential> {
        if let Some(token) = &self.jwt {
            return Some(Credential::jwt(token.clone()));
        }
        self.user.as_ref().map(|user| {
            Credential::basic(user.clone(), self.password.clone().unwrap_or_default())
        })
    }
}

/// File representation of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Endpoints such as `tcp://db1:8529` or `db2:8529`.
    pub hosts: Vec<String>,
    pub admin_database: String,
    pub auth: AuthSection,
    pub acquire_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub idle_ttl_secs: u64,
    pub max_chunk_content: usize,
    pub refresh_host_list: bool,
    pub host_list_refresh_interval_secs: u64,
    pub load_balancing: LoadBalancingStrategy,
    pub content_type: ContentType,
    pub max_connections_per_host: usize,
    pub max_in_flight: usize,
    pub tls_enabled: bool,
    pub tls: TlsOptions,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:8529".to_string()],
            admin_database: DEFAULT_ADMIN_DATABASE.to_string(),
            auth: AuthSection::default(),
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT.as_secs(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            idle_ttl_secs: DEFAULT_IDLE_TTL.as_secs(),
            max_chunk_content: DEFAULT_MAX_CHUNK_CONTENT,
            refresh_host_list: false,
            host_list_refresh_interval_secs: DEFAULT_HOST_LIST_REFRESH_INTERVAL.as_secs(),
            load_balancing: LoadBalancingStrategy::default(),
            content_type: ContentType::default(),
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            tls_enabled: false,
            tls: TlsOptions::default(),
        }
    }
}

impl ConfigFile {
    /// Loads the file named by DBWIRE_CONFIG (if set), then applies
    /// environment variable overrides.
    pub fn load() -> Result<Self, CommError> {
        let mut config = match std::env::var("DBWIRE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CommError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CommError::ConfigValidation(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            CommError::ConfigValidation(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Applies DBWIRE_* environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let flag = |value: String| value == "1" || value.to_lowercase() == "true";

        if let Some(hosts) = var("DBWIRE_HOSTS") {
            self.hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(db) = var("DBWIRE_ADMIN_DATABASE") {
            self.admin_database = db;
        }
        if let Some(user) = var("DBWIRE_USER") {
            self.auth.user = Some(user);
        }
        if let Some(password) = var("DBWIRE_PASSWORD") {
            self.auth.password = Some(password);
        }
        if let Some(token) = var("DBWIRE_JWT") {
            self.auth.jwt = Some(token);
        }
        if let Some(secs) = var("DBWIRE_ACQUIRE_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.acquire_timeout_secs = secs;
        }
        if let Some(secs) = var("DBWIRE_CONNECT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.connect_timeout_secs = secs;
        }
        if let Some(secs) = var("DBWIRE_IDLE_TTL").and_then(|v| v.parse().ok()) {
            self.idle_ttl_secs = secs;
        }
        if let Some(size) = var("DBWIRE_MAX_CHUNK_CONTENT").and_then(|v| v.parse().ok()) {
            self.max_chunk_content = size;
        }
        if let Some(enabled) = var("DBWIRE_REFRESH_HOST_LIST") {
            self.refresh_host_list = flag(enabled);
        }
        if let Some(secs) = var("DBWIRE_REFRESH_INTERVAL").and_then(|v| v.parse().ok()) {
            self.host_list_refresh_interval_secs = secs;
        }
        if let Some(strategy) = var("DBWIRE_LOAD_BALANCING").and_then(|v| v.parse().ok()) {
            self.load_balancing = strategy;
        }
        if let Some(content_type) = var("DBWIRE_CONTENT_TYPE").and_then(|v| v.parse().ok()) {
            self.content_type = content_type;
        }
        if let Some(enabled) = var("DBWIRE_TLS_ENABLED") {
            self.tls_enabled = flag(enabled);
        }
        if let Some(path) = var("DBWIRE_TLS_CA") {
            self.tls.ca_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("DBWIRE_TLS_CERT") {
            self.tls.client_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("DBWIRE_TLS_KEY") {
            self.tls.client_key_path = Some(PathBuf::from(path));
        }
        if let Some(name) = var("DBWIRE_TLS_SERVER_NAME") {
            self.tls.server_name = Some(name);
        }
    }

    /// Converts into a validated [`CommunicationConfig`].
    pub fn into_config(self) -> Result<CommunicationConfig, CommError> {
        let hosts = self
            .hosts
            .iter()
            .map(|endpoint| {
                HostDescription::parse_endpoint(endpoint)
                    .map_err(|e| CommError::ConfigValidation(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = CommunicationConfig::builder()
            .hosts(hosts)
            .admin_database(self.admin_database)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .idle_ttl(Duration::from_secs(self.idle_ttl_secs))
            .max_chunk_content(self.max_chunk_content)
            .refresh_host_list(self.refresh_host_list)
            .host_list_refresh_interval(Duration::from_secs(
                self.host_list_refresh_interval_secs,
            ))
            .load_balancing(self.load_balancing)
            .content_type(self.content_type)
            .max_connections_per_host(self.max_connections_per_host)
            .max_in_flight(self.max_in_flight);

        if let Some(credential) = self.auth.credential() {
            builder = builder.credential(credential);
        }
        if self.tls_enabled {
            builder = builder.tls(self.tls);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn host() -> HostDescription {
        HostDescription::new("127.0.0.1", 8529)
    }

    #[test]
    fn test_defaults() {
        let config = CommunicationConfig::builder().host(host()).build().unwrap();
        assert_eq!(config.admin_database(), "_system");
        assert_eq!(config.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(config.idle_ttl(), Duration::from_secs(300));
        assert_eq!(config.max_chunk_content(), 30_000);
        assert!(!config.refresh_host_list());
        assert_eq!(config.load_balancing(), LoadBalancingStrategy::None);
        assert_eq!(config.content_type(), ContentType::Json);
        assert!(config.credential().is_none());
        assert!(config.tls().is_none());
    }

    #[test]
    fn test_acquire_timeout_equal_to_refresh_interval_is_rejected() {
        let result = CommunicationConfig::builder()
            .host(host())
            .refresh_host_list(true)
            .host_list_refresh_interval(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .build();
        assert!(matches!(result, Err(CommError::ConfigValidation(_))));

        let ok = CommunicationConfig::builder()
            .host(host())
            .refresh_host_list(true)
            .host_list_refresh_interval(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(9))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let cases = [
            CommunicationConfig::builder(),
            CommunicationConfig::builder().host(host()).admin_database(""),
            CommunicationConfig::builder()
                .host(host())
                .acquire_timeout(Duration::ZERO),
            CommunicationConfig::builder().host(host()).max_chunk_content(0),
            CommunicationConfig::builder()
                .host(host())
                .max_chunk_content(MAX_CHUNK_LENGTH as usize),
            CommunicationConfig::builder()
                .host(host())
                .max_connections_per_host(0),
            CommunicationConfig::builder().host(host()).max_in_flight(0),
            CommunicationConfig::builder().host(host()).tls(TlsOptions {
                client_cert_path: Some(PathBuf::from("/tmp/cert.pem")),
                ..Default::default()
            }),
        ];
        for builder in cases {
            assert!(matches!(
                builder.build(),
                Err(CommError::ConfigValidation(_))
            ));
        }
    }

    #[test]
    fn test_duplicate_hosts_collapsed() {
        let config = CommunicationConfig::builder()
            .host(HostDescription::new("b", 1))
            .host(HostDescription::new("a", 1))
            .host(HostDescription::new("b", 1))
            .build()
            .unwrap();
        assert_eq!(
            config.hosts(),
            &[HostDescription::new("b", 1), HostDescription::new("a", 1)]
        );
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "round-robin".parse::<LoadBalancingStrategy>().unwrap(),
            LoadBalancingStrategy::RoundRobin
        );
        assert_eq!(
            "ONE_RANDOM".parse::<LoadBalancingStrategy>().unwrap(),
            LoadBalancingStrategy::OneRandom
        );
        assert!("sticky".parse::<LoadBalancingStrategy>().is_err());
    }

    #[test]
    fn test_config_file_loading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
hosts:
  - tcp://db1:8529
  - "ssl://[::1]:8530"
auth:
  user: root
  password: secret
acquire_timeout_secs: 5
load_balancing: round_robin
content_type: pack
max_connections_per_host: 4
"#
        )
        .unwrap();

        let config = ConfigFile::from_file(file.path())
            .unwrap()
            .into_config()
            .unwrap();
        assert_eq!(
            config.hosts(),
            &[HostDescription::new("db1", 8529), HostDescription::new("::1", 8530)]
        );
        assert_eq!(config.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(config.load_balancing(), LoadBalancingStrategy::RoundRobin);
        assert_eq!(config.content_type(), ContentType::Pack);
        assert_eq!(config.max_connections_per_host(), 4);
        assert_eq!(
            config.credential(),
            Some(&Credential::basic("root", "secret"))
        );
        // untouched keys keep their defaults
        assert_eq!(config.idle_ttl(), DEFAULT_IDLE_TTL);
    }

    #[test]
    fn test_config_file_errors() {
        let result = ConfigFile::from_file("/nonexistent/dbwire.yaml");
        assert!(matches!(result, Err(CommError::ConfigValidation(msg)) if msg.contains("read")));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hosts: [unterminated").unwrap();
        let result = ConfigFile::from_file(file.path());
        assert!(matches!(result, Err(CommError::ConfigValidation(msg)) if msg.contains("parse")));

        let file = ConfigFile {
            hosts: vec!["db1".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            file.into_config(),
            Err(CommError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DBWIRE_HOSTS", "db1:1, db2:2,"),
            ("DBWIRE_JWT", "token"),
            ("DBWIRE_ACQUIRE_TIMEOUT", "3"),
            ("DBWIRE_IDLE_TTL", "not-a-number"),
            ("DBWIRE_REFRESH_HOST_LIST", "true"),
            ("DBWIRE_LOAD_BALANCING", "one_random"),
            ("DBWIRE_TLS_ENABLED", "1"),
            ("DBWIRE_TLS_SERVER_NAME", "db.internal"),
        ]);

        let mut file = ConfigFile::default();
        file.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(file.hosts, vec!["db1:1", "db2:2"]);
        assert_eq!(file.idle_ttl_secs, DEFAULT_IDLE_TTL.as_secs());

        let config = file.into_config().unwrap();
        assert_eq!(config.hosts().len(), 2);
        assert_eq!(config.acquire_timeout(), Duration::from_secs(3));
        assert!(config.refresh_host_list());
        assert_eq!(config.load_balancing(), LoadBalancingStrategy::OneRandom);
        assert_eq!(config.credential(), Some(&Credential::jwt("token")));
        assert_eq!(
            config.tls().and_then(|t| t.server_name.as_deref()),
            Some("db.internal")
        );
    }

    #[test]
    fn test_yaml_roundtrip() {
        let file = ConfigFile::default();
        let yaml = serde_yaml::to_string(&file).unwrap();
        let parsed: ConfigFile = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.hosts, file.hosts);
        assert_eq!(parsed.load_balancing, file.load_balancing);
    }
}
