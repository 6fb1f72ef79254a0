//! Daemon configuration.
//!
//! Configuration is assembled from three layers, last one wins: built-in
//! defaults, an optional TOML file, and the environment variables the hub
//! is deployed with (`FEDERATION_JWT_SECRET`, `FEDERATION_SYNC_INTERVAL`,
//! `<PEER>_FEDERATION_ENDPOINT`, `MAX_CONCURRENT_REQUESTS`,
//! `HEARTBEAT_INTERVAL_MS`, `BUNDLE_SIGNING_KEY_ID`).

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::trust::InstanceCode;

//----------- Config -----------------------------------------------------------

/// The hub configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// This hub's own instance code.
    pub instance_code: InstanceCode,

    /// Where the admin/peer HTTP API listens.
    pub listen_addr: SocketAddr,

    /// The root of all persisted hub data.
    pub data_dir: Utf8PathBuf,

    /// The policy source tree bundles are assembled from.
    pub policy_dir: Utf8PathBuf,

    pub federation: FederationConfig,

    pub signing: SigningConfig,

    pub logging: LoggingConfig,
}

impl Config {
    /// The global state file.
    pub fn state_file(&self) -> Utf8PathBuf {
        self.data_dir.join("state.db")
    }

    /// The content-addressed bundle artifact store.
    pub fn artifact_dir(&self) -> Utf8PathBuf {
        self.data_dir.join("bundles")
    }

    /// Register command-line arguments.
    pub fn setup_cli(cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("config")
                .long("config")
                .short('c')
                .value_name("PATH")
                .help("Path to the configuration file"),
        )
        .arg(
            clap::Arg::new("instance_code")
                .long("instance-code")
                .value_name("CODE")
                .help("This hub's alpha-3 instance code"),
        )
        .arg(
            clap::Arg::new("listen")
                .long("listen")
                .value_name("ADDR")
                .help("Listen address for the HTTP API"),
        )
        .arg(
            clap::Arg::new("data_dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Directory for persisted hub state"),
        )
        .arg(
            clap::Arg::new("policy_dir")
                .long("policy-dir")
                .value_name("DIR")
                .help("Policy source tree to build bundles from"),
        )
    }

    /// Assemble the configuration from arguments, file and environment.
    pub fn init(matches: &clap::ArgMatches) -> Result<Self, ConfigError> {
        let spec = match matches.get_one::<String>("config") {
            Some(path) => {
                let path = Utf8Path::new(path);
                Spec::load(path)
                    .map_err(|err| ConfigError::File(path.to_owned(), err.to_string()))?
            }
            None => Spec::default(),
        };
        let mut config = spec.parse()?;

        // Command-line overrides.
        if let Some(code) = matches.get_one::<String>("instance_code") {
            config.instance_code = code
                .parse()
                .map_err(|_| ConfigError::InvalidValue("instance-code", code.clone()))?;
        }
        if let Some(addr) = matches.get_one::<String>("listen") {
            config.listen_addr = addr
                .parse()
                .map_err(|_| ConfigError::InvalidValue("listen", addr.clone()))?;
        }
        if let Some(dir) = matches.get_one::<String>("data_dir") {
            config.data_dir = dir.into();
        }
        if let Some(dir) = matches.get_one::<String>("policy_dir") {
            config.policy_dir = dir.into();
        }

        // Environment overrides.
        config.apply_env(std::env::vars())?;

        if config.federation.jwt_secret.is_empty() {
            return Err(ConfigError::MissingJwtSecret);
        }

        Ok(config)
    }

    /// Apply the deployment environment variables.
    ///
    /// Taking the variables as an iterator keeps this testable without
    /// mutating the process environment.
    pub fn apply_env(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (key, value) in vars {
            match key.as_str() {
                "FEDERATION_JWT_SECRET" => {
                    self.federation.jwt_secret = value;
                }
                "FEDERATION_SYNC_INTERVAL" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidEnv(key.clone(), value.clone()))?;
                    self.federation.sync_interval = Duration::from_secs(secs);
                }
                "MAX_CONCURRENT_REQUESTS" => {
                    let n: usize = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidEnv(key.clone(), value.clone()))?;
                    self.federation.max_concurrent_requests = n.max(1);
                }
                "HEARTBEAT_INTERVAL_MS" => {
                    let ms: u64 = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidEnv(key.clone(), value.clone()))?;
                    self.federation.heartbeat_interval = Duration::from_millis(ms);
                }
                "BUNDLE_SIGNING_KEY_ID" => {
                    self.signing.key_id = value;
                }
                "DATA_PLANE_URL" => {
                    let url = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidEnv(key.clone(), value.clone()))?;
                    self.federation.data_plane_url = Some(url);
                }
                _ => {
                    // '<CODE>_FEDERATION_ENDPOINT' declares a peer.
                    if let Some(prefix) = key.strip_suffix("_FEDERATION_ENDPOINT") {
                        let code: InstanceCode = prefix
                            .parse()
                            .map_err(|_| ConfigError::InvalidEnv(key.clone(), value.clone()))?;
                        let endpoint: Url = value
                            .parse()
                            .map_err(|_| ConfigError::InvalidEnv(key.clone(), value.clone()))?;
                        match self
                            .federation
                            .peers
                            .iter_mut()
                            .find(|p| p.code == code)
                        {
                            Some(peer) => peer.endpoint = endpoint,
                            None => self.federation.peers.push(PeerConfig { code, endpoint }),
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

//----------- FederationConfig -------------------------------------------------

/// Settings governing cross-instance traffic.
#[derive(Clone, Debug)]
pub struct FederationConfig {
    /// The shared secret for federation service JWTs.
    pub jwt_secret: String,

    /// How often each peer pair is synced.
    pub sync_interval: Duration,

    /// The configured peer hubs.
    pub peers: Vec<PeerConfig>,

    /// The cap on concurrent outbound requests.
    pub max_concurrent_requests: usize,

    /// The deadline applied to every outbound call.
    pub request_timeout: Duration,

    /// How often spokes are expected to heartbeat.
    pub heartbeat_interval: Duration,

    /// Where bundles and ground-truth data are pushed.
    pub data_plane_url: Option<Url>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            sync_interval: Duration::from_secs(300),
            peers: Vec::new(),
            max_concurrent_requests: 10,
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            data_plane_url: None,
        }
    }
}

/// A configured peer hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    pub code: InstanceCode,
    pub endpoint: Url,
}

//----------- SigningConfig ----------------------------------------------------

/// Bundle signing settings.
#[derive(Clone, Debug, Default)]
pub struct SigningConfig {
    /// PKCS#8 Ed25519 key file.  Absent means signed builds fail.
    pub key_path: Option<Utf8PathBuf>,

    /// The key identifier recorded as `signed-by`.
    pub key_id: String,
}

//----------- LoggingConfig ----------------------------------------------------

/// Where and how verbosely to log.
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub target: LogTarget,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            target: LogTarget::Stdout,
        }
    }
}

/// A logging destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
    File(Utf8PathBuf),
}

//----------- Spec -------------------------------------------------------------

/// The configuration file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Spec {
    #[serde(default)]
    instance_code: Option<String>,

    #[serde(default)]
    listen: Option<SocketAddr>,

    #[serde(default)]
    data_dir: Option<Utf8PathBuf>,

    #[serde(default)]
    policy_dir: Option<Utf8PathBuf>,

    #[serde(default)]
    federation: FederationSpec,

    #[serde(default)]
    signing: SigningSpec,

    #[serde(default)]
    logging: LoggingSpec,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct FederationSpec {
    #[serde(default)]
    jwt_secret: Option<String>,

    /// Seconds between federation sync cycles.
    #[serde(default)]
    sync_interval: Option<u64>,

    #[serde(default)]
    max_concurrent_requests: Option<usize>,

    /// Seconds before an outbound call is abandoned.
    #[serde(default)]
    request_timeout: Option<u64>,

    /// Milliseconds between expected spoke heartbeats.
    #[serde(default)]
    heartbeat_interval_ms: Option<u64>,

    #[serde(default)]
    data_plane_url: Option<Url>,

    #[serde(default)]
    peers: Vec<PeerSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PeerSpec {
    code: String,
    endpoint: Url,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct SigningSpec {
    #[serde(default)]
    key_path: Option<Utf8PathBuf>,
    #[serde(default)]
    key_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct LoggingSpec {
    #[serde(default)]
    level: Option<String>,
    /// "stdout", "stderr", or a file path.
    #[serde(default)]
    target: Option<String>,
}

impl Spec {
    /// Load the configuration file.
    pub fn load(path: &Utf8Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    /// Parse from this specification.
    pub fn parse(self) -> Result<Config, ConfigError> {
        let instance_code = match self.instance_code {
            Some(code) => code
                .parse()
                .map_err(|_| ConfigError::InvalidValue("instance-code", code))?,
            None => "HUB".parse().unwrap(),
        };

        let mut federation = FederationConfig {
            jwt_secret: self.federation.jwt_secret.unwrap_or_default(),
            ..Default::default()
        };
        if let Some(secs) = self.federation.sync_interval {
            federation.sync_interval = Duration::from_secs(secs);
        }
        if let Some(n) = self.federation.max_concurrent_requests {
            federation.max_concurrent_requests = n.max(1);
        }
        if let Some(secs) = self.federation.request_timeout {
            federation.request_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.federation.heartbeat_interval_ms {
            federation.heartbeat_interval = Duration::from_millis(ms);
        }
        federation.data_plane_url = self.federation.data_plane_url;
        for peer in self.federation.peers {
            let code = peer
                .code
                .parse()
                .map_err(|_| ConfigError::InvalidValue("peer code", peer.code.clone()))?;
            federation.peers.push(PeerConfig {
                code,
                endpoint: peer.endpoint,
            });
        }

        let logging = LoggingConfig {
            level: self.logging.level.unwrap_or_else(|| "info".into()),
            target: match self.logging.target.as_deref() {
                None | Some("stdout") => LogTarget::Stdout,
                Some("stderr") => LogTarget::Stderr,
                Some(path) => LogTarget::File(path.into()),
            },
        };

        Ok(Config {
            instance_code,
            listen_addr: self
                .listen
                .unwrap_or_else(|| "127.0.0.1:8470".parse().unwrap()),
            data_dir: self
                .data_dir
                .unwrap_or_else(|| Utf8PathBuf::from("/var/lib/trellis")),
            policy_dir: self
                .policy_dir
                .unwrap_or_else(|| Utf8PathBuf::from("/etc/trellis/policies")),
            federation,
            signing: SigningConfig {
                key_path: self.signing.key_path,
                key_id: self.signing.key_id.unwrap_or_else(|| "hub-signing".into()),
            },
            logging,
        })
    }
}

//----------- ConfigError ------------------------------------------------------

/// An error assembling the configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration file could not be read or parsed.
    File(Utf8PathBuf, String),

    /// A setting has an invalid value.
    InvalidValue(&'static str, String),

    /// An environment variable has an invalid value.
    InvalidEnv(String, String),

    /// No federation JWT secret is configured.
    MissingJwtSecret,
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path, err) => write!(f, "{path}: {err}"),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value '{value}' for '{name}'")
            }
            Self::InvalidEnv(name, value) => {
                write!(f, "invalid value '{value}' for environment variable {name}")
            }
            Self::MissingJwtSecret => {
                f.write_str("FEDERATION_JWT_SECRET is not set and no jwt-secret is configured")
            }
        }
    }
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config = Spec::default().parse().unwrap();
        assert_eq!(config.instance_code.as_str(), "HUB");
        assert_eq!(config.federation.sync_interval, Duration::from_secs(300));
        assert_eq!(config.federation.max_concurrent_requests, 10);
        assert_eq!(config.federation.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn file_spec_round_trip() {
        let spec: Spec = toml::from_str(
            r#"
            instance-code = "USA"
            listen = "0.0.0.0:9000"

            [federation]
            jwt-secret = "s3cret"
            sync-interval = 60

            [[federation.peers]]
            code = "FRA"
            endpoint = "https://hub.fra.example/"
            "#,
        )
        .unwrap();
        let config = spec.parse().unwrap();
        assert_eq!(config.instance_code.as_str(), "USA");
        assert_eq!(config.federation.jwt_secret, "s3cret");
        assert_eq!(config.federation.sync_interval, Duration::from_secs(60));
        assert_eq!(config.federation.peers.len(), 1);
        assert_eq!(config.federation.peers[0].code.as_str(), "FRA");
    }

    #[test]
    fn env_overrides() {
        let mut config = Spec::default().parse().unwrap();
        config
            .apply_env([
                ("FEDERATION_JWT_SECRET".to_owned(), "topsecret".to_owned()),
                ("FEDERATION_SYNC_INTERVAL".to_owned(), "120".to_owned()),
                ("MAX_CONCURRENT_REQUESTS".to_owned(), "4".to_owned()),
                ("HEARTBEAT_INTERVAL_MS".to_owned(), "15000".to_owned()),
                (
                    "USA_FEDERATION_ENDPOINT".to_owned(),
                    "https://hub.usa.example/".to_owned(),
                ),
                ("BUNDLE_SIGNING_KEY_ID".to_owned(), "hub-2026".to_owned()),
            ])
            .unwrap();

        assert_eq!(config.federation.jwt_secret, "topsecret");
        assert_eq!(config.federation.sync_interval, Duration::from_secs(120));
        assert_eq!(config.federation.max_concurrent_requests, 4);
        assert_eq!(
            config.federation.heartbeat_interval,
            Duration::from_millis(15000)
        );
        assert_eq!(config.federation.peers.len(), 1);
        assert_eq!(config.federation.peers[0].code.as_str(), "USA");
        assert_eq!(config.signing.key_id, "hub-2026");
    }

    #[test]
    fn bad_env_values_fail_loudly() {
        let mut config = Spec::default().parse().unwrap();
        let err = config
            .apply_env([("FEDERATION_SYNC_INTERVAL".to_owned(), "soon".to_owned())])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv(_, _)));
    }
}
