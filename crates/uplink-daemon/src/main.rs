mod egress;
mod ifaces;
mod monitor;
mod observation;
mod overlay;
mod selector;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ifaces::Ifaces;
use crate::observation::ObservationLog;
use crate::overlay::{OverlayRoutes, ZeroTierApi};
use crate::selector::{Heuristic, LearnedModel, Selector};
use crate::store::HealthStore;

#[derive(Parser, Debug)]
#[command(name = "uplink-daemon", about = "Multi-homed SOCKS5 egress daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/uplink.toml")]
    config: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenSection,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub dial: DialSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub selector: SelectorSection,
    #[serde(default)]
    pub overlay: OverlaySection,
    #[serde(default)]
    pub observation: ObservationSection,
    /// Pinned interface list; empty means "ask the OS at startup"
    #[serde(default)]
    pub interfaces: Vec<IfaceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenSection {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSection {
    #[serde(default = "default_probe_host")]
    pub host: String,
    #[serde(default = "default_probe_port")]
    pub port: u16,
    #[serde(default = "default_probe_period")]
    pub period_seconds: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_outage_backoff")]
    pub outage_backoff_seconds: u64,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            host: default_probe_host(),
            port: default_probe_port(),
            period_seconds: default_probe_period(),
            timeout_seconds: default_probe_timeout(),
            outage_backoff_seconds: default_outage_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DialSection {
    #[serde(default = "default_dial_timeout")]
    pub timeout_seconds: u64,
}

impl Default for DialSection {
    fn default() -> Self {
        Self {
            timeout_seconds: default_dial_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_history_length")]
    pub history_length: usize,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            history_length: default_history_length(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorSection {
    /// "heuristic" or "model"
    #[serde(default = "default_selector_policy")]
    pub policy: String,
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
    #[serde(default = "default_success_weight")]
    pub success_weight: f64,
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            policy: default_selector_policy(),
            model_path: None,
            latency_weight: default_latency_weight(),
            success_weight: default_success_weight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverlaySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_overlay_api_url")]
    pub api_url: String,
    pub auth_token: Option<String>,
    pub auth_token_file: Option<PathBuf>,
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: default_overlay_api_url(),
            auth_token: None,
            auth_token_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ObservationSection {
    /// CSV file fed to the offline trainer; unset disables the log
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IfaceEntry {
    pub name: String,
    pub ipv4: String,
}

// Default value functions
fn default_listen_host() -> String { uplink_protocol::DEFAULT_LISTEN_HOST.to_string() }
fn default_listen_port() -> u16 { uplink_protocol::DEFAULT_LISTEN_PORT }
fn default_probe_host() -> String { uplink_protocol::DEFAULT_PROBE_HOST.to_string() }
fn default_probe_port() -> u16 { uplink_protocol::DEFAULT_PROBE_PORT }
fn default_probe_period() -> u64 { uplink_protocol::DEFAULT_PROBE_PERIOD_SECS }
fn default_probe_timeout() -> u64 { uplink_protocol::DEFAULT_PROBE_TIMEOUT_SECS }
fn default_outage_backoff() -> u64 { uplink_protocol::DEFAULT_OUTAGE_BACKOFF_SECS }
fn default_dial_timeout() -> u64 { uplink_protocol::DEFAULT_DIAL_TIMEOUT_SECS }
fn default_history_length() -> usize { uplink_protocol::DEFAULT_HISTORY_LEN }
fn default_selector_policy() -> String { "heuristic".to_string() }
fn default_latency_weight() -> f64 { selector::DEFAULT_LATENCY_WEIGHT }
fn default_success_weight() -> f64 { selector::DEFAULT_SUCCESS_WEIGHT }
fn default_overlay_api_url() -> String { "http://127.0.0.1:9993".to_string() }

/// Shared state accessible across all tasks. Everything but the store is
/// read-only after startup.
pub struct SharedState {
    pub config: Config,
    pub interfaces: Ifaces,
    pub store: Arc<HealthStore>,
    pub selector: Selector,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config: Config = if args.config.exists() {
        let config_str = tokio::fs::read_to_string(&args.config)
            .await
            .with_context(|| format!("failed to read config file {:?}", args.config))?;
        toml::from_str(&config_str).map_err(|e| {
            error!("Failed to parse config: {}", e);
            e
        })?
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };

    // Interfaces are fixed for the lifetime of the run
    let interfaces = if config.interfaces.is_empty() {
        ifaces::enumerate()?
    } else {
        let entries: Vec<(String, String)> = config
            .interfaces
            .iter()
            .map(|e| (e.name.clone(), e.ipv4.clone()))
            .collect();
        ifaces::from_entries(&entries)?
    };
    if interfaces.is_empty() {
        anyhow::bail!("no usable egress interfaces found");
    }
    info!(
        count = interfaces.len(),
        names = ?interfaces.names().collect::<Vec<_>>(),
        "Egress interfaces"
    );

    let store = Arc::new(HealthStore::new(
        interfaces.names(),
        config.health.history_length,
    ));
    let selector = build_selector(&config.selector);
    let overlay = overlay_client(&config.overlay);
    let observations = match &config.observation.path {
        Some(path) => Some(ObservationLog::open(path).await?),
        None => None,
    };

    // Bind before spawning so a taken port is a startup failure, not a
    // background log line
    let listen_addr = format!("{}:{}", config.listen.host, config.listen.port);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind SOCKS5 listener on {listen_addr}"))?;
    info!(addr = %listen_addr, "SOCKS5 proxy listening");

    let state = Arc::new(SharedState {
        config,
        interfaces,
        store,
        selector,
    });

    let cancel = CancellationToken::new();

    let mut monitor_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = monitor::run(state, overlay, observations, cancel).await {
                error!("Health monitor error: {}", e);
            }
        })
    };

    let mut server_handle = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(listener, state, cancel).await {
                error!("SOCKS5 server error: {}", e);
            }
        })
    };

    info!("Daemon running");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    cancel.cancel();

    // Give the tasks a moment to drain before pulling the plug
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        let _ = (&mut monitor_handle).await;
        let _ = (&mut server_handle).await;
    })
    .await;
    monitor_handle.abort();
    server_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

fn build_selector(cfg: &SelectorSection) -> Selector {
    match cfg.policy.as_str() {
        "model" => match &cfg.model_path {
            Some(path) => match LearnedModel::load(path) {
                Ok(model) => {
                    info!(path = %path.display(), "Loaded selector model");
                    return Selector::Model(model);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load selector model, falling back to heuristic");
                }
            },
            None => {
                warn!("selector.policy = \"model\" but no model_path set, falling back to heuristic");
            }
        },
        "heuristic" => {}
        other => {
            warn!(policy = %other, "Unknown selector policy, using heuristic");
        }
    }
    Selector::Heuristic(Heuristic {
        latency_weight: cfg.latency_weight,
        success_weight: cfg.success_weight,
    })
}

fn overlay_client(cfg: &OverlaySection) -> Option<Arc<dyn OverlayRoutes>> {
    if !cfg.enabled {
        return None;
    }
    let token = cfg.auth_token.clone().or_else(|| {
        let path = cfg.auth_token_file.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(token) => Some(token.trim().to_string()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read overlay auth token file");
                None
            }
        }
    });
    match token {
        Some(token) => {
            info!(api = %cfg.api_url, "Overlay route lookup enabled");
            Some(Arc::new(ZeroTierApi::new(cfg.api_url.clone(), token)))
        }
        None => {
            warn!("Overlay enabled but no auth token available; overlay lookups disabled");
            None
        }
    }
}
