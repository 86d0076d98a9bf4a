//! Application context
//!
//! Owns every component and its collaborators (store, shell, modem
//! transport), brings them up in order once configuration is available, and
//! tears them down again. Nothing here is process-global.

use std::path::Path as FsPath;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::checkpoint::{CheckpointConfig, CheckpointEvent, ConfigCheckpoint};
use crate::device::Transport;
use crate::modem::{ModemConfig, ModemWatcher};
use crate::proxy::{GatewayConfig, GatewayProxy, ProxySettings, ProxyStats};
use crate::route::{PppConfig, RouteWatcher};
use crate::shell::Shell;
use crate::store::KeyValueStore;
use crate::store::schema::CONFIG_KEY;
use crate::template::HashTemplate;
use crate::watcher::WatcherConfig;
use crate::{GatewayError, Result};

const COMPONENT: &str = "gateway";

/// Install a formatting subscriber filtered by `RUST_LOG`, defaulting to
/// `info`. Later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Process-level settings, read from a YAML file.
///
/// ```yaml
/// configKey: m2m-config
/// watcher:
///   retryInterval: 5000
/// modem:
///   reportFile: /dev/ttyUSB2
///   rssiInterval: 60000
/// ppp:
///   routeInterval: 15000
/// proxy:
///   bindAddress: 0.0.0.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewaySettings {
    pub config_key: String,
    pub checkpoint: CheckpointConfig,
    pub watcher: WatcherConfig,
    pub modem: ModemConfig,
    pub ppp: PppConfig,
    pub proxy: ProxySettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            config_key: CONFIG_KEY.to_string(),
            checkpoint: CheckpointConfig::default(),
            watcher: WatcherConfig::default(),
            modem: ModemConfig::default(),
            ppp: PppConfig::default(),
            proxy: ProxySettings::default(),
        }
    }
}

impl GatewaySettings {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml)
            .map_err(|e| GatewayError::config_error(format!("invalid settings: {e}")))
    }

    pub async fn load(path: impl AsRef<FsPath>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::io_error(format!("read {}", path.display()), e))?;
        Self::from_yaml(&yaml)
    }
}

/// Readiness of each component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// The key-value store answered a request.
    pub store: bool,
    pub config: bool,
    pub modem: bool,
    pub ppp: bool,
    pub proxy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<ProxyStats>,
}

pub struct GatewayContext {
    settings: GatewaySettings,
    store: Arc<dyn KeyValueStore>,
    modem_transport: Option<Arc<dyn Transport>>,
    checkpoint: ConfigCheckpoint,
    ppp: RouteWatcher,
    modem: Option<ModemWatcher>,
    proxy: Option<GatewayProxy>,
}

impl GatewayContext {
    pub fn new(
        settings: GatewaySettings,
        store: Arc<dyn KeyValueStore>,
        shell: Arc<dyn Shell>,
    ) -> Self {
        let checkpoint = ConfigCheckpoint::for_template(
            Arc::clone(&store),
            settings.config_key.clone(),
            HashTemplate::gateway(),
            settings.checkpoint.clone(),
        );
        let ppp = RouteWatcher::new(shell, settings.watcher.clone());
        Self { settings, store, modem_transport: None, checkpoint, ppp, modem: None, proxy: None }
    }

    /// Talk to the modem over `transport` instead of the configured serial device.
    pub fn with_modem_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.modem_transport = Some(transport);
        self
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn checkpoint(&self) -> &ConfigCheckpoint {
        &self.checkpoint
    }

    pub fn modem(&self) -> Option<&ModemWatcher> {
        self.modem.as_ref()
    }

    pub fn ppp(&self) -> &RouteWatcher {
        &self.ppp
    }

    pub fn proxy(&self) -> Option<&GatewayProxy> {
        self.proxy.as_ref()
    }

    pub fn started(&self) -> bool {
        self.checkpoint.started()
    }

    /// Wait for configuration, then start the modem watcher, the route
    /// watcher and the proxy. Waits indefinitely while the configuration
    /// hash lacks required fields.
    pub async fn start(&mut self) -> Result<()> {
        if self.started() {
            return Err(GatewayError::AlreadyStarted { component: COMPONENT });
        }

        let config = self.await_config().await?;
        if let Err(e) = self.bring_up(config).await {
            self.stop_all().await;
            return Err(e);
        }
        Ok(())
    }

    async fn await_config(&mut self) -> Result<Map<String, Value>> {
        let mut events = self.checkpoint.start()?;
        loop {
            match events.recv().await {
                Some(CheckpointEvent::Retry) => debug!("[{}] waiting for configuration", COMPONENT),
                Some(CheckpointEvent::Ready(config)) => return Ok(config),
                None => return Err(GatewayError::Closed { context: "config checkpoint".into() }),
            }
        }
    }

    async fn bring_up(&mut self, config: Map<String, Value>) -> Result<()> {
        let gateway: GatewayConfig = serde_json::from_value(Value::Object(config))?;

        let hash = self.store.hgetall(&self.settings.config_key).await?;
        let ppp: PppConfig = overlay(&self.settings.ppp, HashTemplate::ppp().to_config(&hash)?)?;
        let modem_config: ModemConfig =
            overlay(&self.settings.modem, HashTemplate::modem().to_config(&hash)?)?;

        let transport: Arc<dyn Transport> = match &self.modem_transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(modem_config.device()),
        };
        let mut modem =
            ModemWatcher::new(transport, modem_config.rssi_interval, self.settings.watcher.clone());
        modem.start()?;
        self.modem = Some(modem);

        self.ppp.start(ppp)?;

        info!("[{}] relaying with primary path {}", COMPONENT, gateway.primary);
        let proxy =
            GatewayProxy::start(gateway, Arc::clone(&self.store), &self.settings.proxy).await?;
        self.proxy = Some(proxy);
        Ok(())
    }

    /// Stop every component that is running. The relay ports are released
    /// before this returns, so the context can be started again.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.started() {
            return Err(GatewayError::NotStarted { component: COMPONENT });
        }
        info!("[{}] shutting down", COMPONENT);
        self.stop_all().await;
        Ok(())
    }

    async fn stop_all(&mut self) {
        if let Some(mut proxy) = self.proxy.take() {
            let _ = proxy.stop().await;
        }
        if let Some(modem) = self.modem.as_mut().filter(|modem| modem.started()) {
            let _ = modem.stop();
        }
        if self.ppp.started() {
            let _ = self.ppp.stop();
        }
        if self.checkpoint.started() {
            let _ = self.checkpoint.stop();
        }
    }

    pub async fn status(&self) -> GatewayStatus {
        let store = match self.store.keys(&self.settings.config_key).await {
            Ok(_) => true,
            Err(e) => {
                warn!("[{}] store unavailable: {}", COMPONENT, e);
                false
            }
        };
        GatewayStatus {
            store,
            config: self.checkpoint.ready(),
            modem: self.modem.as_ref().is_some_and(ModemWatcher::ready),
            ppp: self.ppp.ready(),
            proxy: self.proxy.as_ref().is_some_and(GatewayProxy::started),
            imei: self.modem.as_ref().and_then(ModemWatcher::imei),
            relay: self.proxy.as_ref().map(GatewayProxy::stats),
        }
    }
}

/// Apply config fields from the store on top of file settings.
fn overlay<T: Serialize + DeserializeOwned>(base: &T, overrides: Map<String, Value>) -> Result<T> {
    let mut value = serde_json::to_value(base)?;
    if let Value::Object(fields) = &mut value {
        fields.extend(overrides);
    }
    Ok(serde_json::from_value(value)?)
}
