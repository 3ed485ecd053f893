use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_SINK_ENDPOINT: &str = "http://127.0.0.1:8080";

const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TLS_TIMEOUT_SECS: u64 = 5;
const DEFAULT_KEEP_ALIVE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_MAX: usize = 2000;
const DEFAULT_BANNISHMENT_DURATION_MS: u64 = 3000;

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    pub listen: SocketAddr,
    pub metrics_listen: SocketAddr,
    pub warp_endpoint: Url,
    pub warp_endpoint_delete: Url,
    pub connection: ConnectionConf,
    pub bannishment_duration: Duration,
    pub graphite_listen: SocketAddr,
    pub graphite_parse: bool,
    pub dryrun: bool,
    pub hostname: String,
    pub log_directive: Option<String>,
}

/// Timeouts and pooling for the shared sink HTTP client.
#[derive(Debug, Clone)]
pub struct ConnectionConf {
    pub timeout: Duration,
    pub dial_timeout: Duration,
    pub tls_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub idle_max: usize,
}

/// On-disk configuration (`catalyst.json`). Every field is optional;
/// defaults describe a standalone deployment in front of a local sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfFile {
    pub listen: Option<SocketAddr>,
    pub metrics_listen: Option<SocketAddr>,
    pub warp_endpoint: Option<Url>,
    pub warp_endpoint_delete: Option<Url>,
    pub warp_connection: Option<ConnectionConfFile>,
    pub bannishment_duration_ms: Option<u64>,
    pub graphite_listen: Option<SocketAddr>,
    pub graphite_parse: Option<bool>,
    pub dryrun: Option<bool>,
    pub hostname: Option<String>,
    pub log_directive: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfFile {
    pub timeout_secs: Option<u64>,
    pub dial_timeout_secs: Option<u64>,
    pub tls_timeout_secs: Option<u64>,
    pub keep_alive_timeout_secs: Option<u64>,
    pub idle_max: Option<usize>,
}

impl Conf {
    pub fn from_conf_file(file: &ConfFile) -> anyhow::Result<Self> {
        let default_endpoint = Url::parse(DEFAULT_SINK_ENDPOINT).context("default sink endpoint")?;

        let connection = file.warp_connection.clone().unwrap_or_default();

        Ok(Conf {
            listen: file
                .listen
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9100)),
            metrics_listen: file
                .metrics_listen
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9105)),
            warp_endpoint: file.warp_endpoint.clone().unwrap_or_else(|| default_endpoint.clone()),
            warp_endpoint_delete: file.warp_endpoint_delete.clone().unwrap_or(default_endpoint),
            connection: ConnectionConf {
                timeout: Duration::from_secs(connection.timeout_secs.unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS)),
                dial_timeout: Duration::from_secs(connection.dial_timeout_secs.unwrap_or(DEFAULT_DIAL_TIMEOUT_SECS)),
                tls_timeout: Duration::from_secs(connection.tls_timeout_secs.unwrap_or(DEFAULT_TLS_TIMEOUT_SECS)),
                keep_alive_timeout: Duration::from_secs(
                    connection
                        .keep_alive_timeout_secs
                        .unwrap_or(DEFAULT_KEEP_ALIVE_TIMEOUT_SECS),
                ),
                idle_max: connection.idle_max.unwrap_or(DEFAULT_IDLE_MAX),
            },
            bannishment_duration: Duration::from_millis(
                file.bannishment_duration_ms.unwrap_or(DEFAULT_BANNISHMENT_DURATION_MS),
            ),
            graphite_listen: file
                .graphite_listen
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 2003)),
            graphite_parse: file.graphite_parse.unwrap_or(true),
            dryrun: file.dryrun.unwrap_or(false),
            hostname: file.hostname.clone().unwrap_or_else(default_hostname),
            log_directive: file.log_directive.clone(),
        })
    }
}

/// Shared handle on the resolved configuration.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<Conf>,
}

impl ConfHandle {
    /// Load the configuration file if one is found and resolve it against
    /// defaults.
    pub fn init(path: Option<&Utf8Path>) -> anyhow::Result<Self> {
        let conf_file = load_conf_file(path)?;
        let conf = Conf::from_conf_file(&conf_file)?;
        Ok(Self { inner: Arc::new(conf) })
    }

    pub fn from_conf(conf: Conf) -> Self {
        Self { inner: Arc::new(conf) }
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.inner)
    }
}

fn load_conf_file(path: Option<&Utf8Path>) -> anyhow::Result<ConfFile> {
    let explicit = path
        .map(Utf8Path::to_path_buf)
        .or_else(|| std::env::var("CATALYST_CONFIG_PATH").ok().map(Utf8PathBuf::from));

    let candidates = match &explicit {
        Some(path) => vec![path.clone()],
        None => vec![
            Utf8PathBuf::from("catalyst.json"),
            Utf8PathBuf::from("/etc/catalyst/catalyst.json"),
        ],
    };

    for candidate in &candidates {
        if !candidate.exists() {
            if explicit.is_some() {
                anyhow::bail!("configuration file not found: {candidate}");
            }
            continue;
        }

        let content = std::fs::read_to_string(candidate)
            .with_context(|| format!("couldn't read configuration file at {candidate}"))?;
        return serde_json::from_str(&content).with_context(|| format!("invalid configuration file at {candidate}"));
    }

    debug!("no configuration file found, using defaults");

    Ok(ConfFile::default())
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|hostname| hostname.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}
