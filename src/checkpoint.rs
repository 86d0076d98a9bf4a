//! Configuration readiness gate
//!
//! Polls a configuration hash until every required field is present, then
//! hands the converted config to the caller once. There is no resource to hold
//! open, so this is a plain polling task rather than a [`crate::Watcher`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::KeyValueStore;
use crate::template::HashTemplate;
use crate::watcher::{DEFAULT_RETRY_INTERVAL, millis};
use crate::{GatewayError, Result};

const COMPONENT: &str = "checkpoint";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckpointConfig {
    #[serde(with = "millis")]
    pub retry_interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { retry_interval: DEFAULT_RETRY_INTERVAL }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointEvent {
    /// Required fields are still missing; another poll is scheduled.
    Retry,
    /// All required fields are present. Sent once per start.
    Ready(Map<String, Value>),
}

pub struct ConfigCheckpoint {
    store: Arc<dyn KeyValueStore>,
    key: String,
    template: Arc<HashTemplate>,
    required: Arc<Vec<String>>,
    config: CheckpointConfig,
    check: Arc<Notify>,
    ready: Arc<AtomicBool>,
    cancel: Option<CancellationToken>,
}

impl ConfigCheckpoint {
    /// Without a template the ready config is empty; without requirements the
    /// first poll is ready even when the hash does not exist.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        template: Option<HashTemplate>,
        required: Option<Vec<String>>,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            template: Arc::new(template.unwrap_or_default()),
            required: Arc::new(required.unwrap_or_default()),
            config,
            check: Arc::new(Notify::new()),
            ready: Arc::new(AtomicBool::new(false)),
            cancel: None,
        }
    }

    /// Gate on the template's own required fields.
    pub fn for_template(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        template: HashTemplate,
        config: CheckpointConfig,
    ) -> Self {
        let required = template.requirements();
        Self::new(store, key, Some(template), Some(required), config)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn template(&self) -> &HashTemplate {
        &self.template
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn started(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Begin polling. Events arrive on the returned receiver, which closes
    /// after `Ready` or when the checkpoint stops.
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<CheckpointEvent>> {
        if self.started() {
            return Err(GatewayError::AlreadyStarted { component: COMPONENT });
        }

        info!("[{}] start checkpoint", COMPONENT);

        let cancel = CancellationToken::new();
        let (events, receiver) = mpsc::unbounded_channel();
        self.ready.store(false, Ordering::SeqCst);

        let poller = Poller {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            template: Arc::clone(&self.template),
            required: Arc::clone(&self.required),
        };
        let retry_interval = self.config.retry_interval;
        let check = Arc::clone(&self.check);
        let ready = Arc::clone(&self.ready);
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                let polled = tokio::select! {
                    _ = token.cancelled() => break,
                    polled = poller.poll() => polled,
                };

                let event = match polled {
                    Ok(Some(config)) => {
                        ready.store(true, Ordering::SeqCst);
                        let _ = events.send(CheckpointEvent::Ready(config));
                        break;
                    }
                    Ok(None) => {
                        info!("[{}] not ready", COMPONENT);
                        CheckpointEvent::Retry
                    }
                    Err(e) => {
                        warn!("[{}] poll error: {}", COMPONENT, e);
                        CheckpointEvent::Retry
                    }
                };
                if events.send(event).is_err() {
                    break;
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = check.notified() => debug!("[{}] check requested", COMPONENT),
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
        });

        self.cancel = Some(cancel);
        Ok(receiver)
    }

    /// Cancel polling, including any pending retry.
    pub fn stop(&mut self) -> Result<()> {
        let Some(cancel) = self.cancel.take() else {
            return Err(GatewayError::NotStarted { component: COMPONENT });
        };

        info!("[{}] stop checkpoint", COMPONENT);
        cancel.cancel();
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Poll again now instead of waiting out the retry interval.
    pub fn check_ready(&self) {
        self.check.notify_one();
    }
}

impl Drop for ConfigCheckpoint {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

struct Poller {
    store: Arc<dyn KeyValueStore>,
    key: String,
    template: Arc<HashTemplate>,
    required: Arc<Vec<String>>,
}

impl Poller {
    async fn poll(&self) -> Result<Option<Map<String, Value>>> {
        let hash = self.store.hgetall(&self.key).await?;
        if let Some(missing) = self.required.iter().find(|field| !hash.contains_key(*field)) {
            debug!("[{}] missing {}", COMPONENT, missing);
            return Ok(None);
        }
        self.template.to_config(&hash).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::CONFIG_KEY;
    use crate::store::{MemoryStore, StoreCall};
    use crate::template::FieldSpec;
    use serde_json::json;

    fn fast() -> CheckpointConfig {
        CheckpointConfig { retry_interval: Duration::from_millis(10) }
    }

    fn hgetalls(count: usize) -> Vec<StoreCall> {
        vec![StoreCall::Hgetall(CONFIG_KEY.to_string()); count]
    }

    #[test]
    fn minimal_construction() {
        let checkpoint = ConfigCheckpoint::new(
            Arc::new(MemoryStore::new()),
            CONFIG_KEY,
            None,
            None,
            CheckpointConfig::default(),
        );
        assert!(checkpoint.template().is_empty());
        assert!(checkpoint.required().is_empty());
        assert_eq!(checkpoint.config().retry_interval, Duration::from_millis(5000));
        assert!(!checkpoint.started());
        assert!(!checkpoint.ready());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_while_no_configuration_exists() {
        let store = Arc::new(MemoryStore::new());
        let required = Some(vec!["something".to_string()]);
        let mut checkpoint =
            ConfigCheckpoint::new(store.clone(), CONFIG_KEY, None, required, fast());
        let mut events = checkpoint.start().unwrap();

        assert_eq!(events.recv().await.unwrap(), CheckpointEvent::Retry);
        assert_eq!(events.recv().await.unwrap(), CheckpointEvent::Retry);
        checkpoint.stop().unwrap();
        assert_eq!(store.snapshot(), hgetalls(2));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn ready_without_requirements_even_when_empty() {
        let store = Arc::new(MemoryStore::new());
        let template =
            HashTemplate::new().field("test", FieldSpec::number("test-key").with_default(1));
        let mut checkpoint = ConfigCheckpoint::new(
            store.clone(),
            CONFIG_KEY,
            Some(template),
            None,
            CheckpointConfig::default(),
        );
        let mut events = checkpoint.start().unwrap();

        let Some(CheckpointEvent::Ready(config)) = events.recv().await else {
            panic!("expected ready");
        };
        assert_eq!(Value::Object(config), json!({"test": 1}));
        assert!(checkpoint.ready());
        assert!(events.recv().await.is_none());

        checkpoint.stop().unwrap();
        assert!(!checkpoint.ready());
        assert_eq!(store.snapshot(), hgetalls(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_every_requirement_is_met() {
        let store = Arc::new(MemoryStore::new());
        store.seed_hash(CONFIG_KEY, [("found", "1"), ("other", "2")]);
        let required = Some(vec!["found".to_string(), "missing".to_string()]);
        let mut checkpoint =
            ConfigCheckpoint::new(store.clone(), CONFIG_KEY, None, required, fast());
        let mut events = checkpoint.start().unwrap();

        assert_eq!(events.recv().await.unwrap(), CheckpointEvent::Retry);
        assert_eq!(events.recv().await.unwrap(), CheckpointEvent::Retry);
        assert!(!checkpoint.ready());

        store.seed_hash(CONFIG_KEY, [("found", "1"), ("missing", "2")]);
        assert_eq!(events.recv().await.unwrap(), CheckpointEvent::Ready(Map::new()));
        checkpoint.stop().unwrap();
        assert_eq!(store.snapshot(), hgetalls(3));
    }

    #[tokio::test]
    async fn gateway_template_produces_proxy_config() {
        let store = Arc::new(MemoryStore::new());
        store.seed_hash(
            CONFIG_KEY,
            [
                ("gateway:imei", "123456789012345"),
                ("gateway:private-host", "private-host"),
                ("gateway:private-port", "1234"),
                ("gateway:public-host", "public-host"),
                ("gateway:public-port", "5678"),
            ],
        );
        let mut checkpoint = ConfigCheckpoint::for_template(
            store.clone(),
            CONFIG_KEY,
            HashTemplate::gateway(),
            CheckpointConfig::default(),
        );
        assert_eq!(checkpoint.required(), ["gateway:imei"]);

        let mut events = checkpoint.start().unwrap();
        let Some(CheckpointEvent::Ready(config)) = events.recv().await else {
            panic!("expected ready");
        };
        checkpoint.stop().unwrap();

        assert_eq!(
            Value::Object(config),
            json!({
                "imei": "123456789012345",
                "primary": "public",
                "privateHost": "private-host",
                "privatePort": 1234,
                "privateRelay": 4000,
                "publicHost": "public-host",
                "publicPort": 5678,
                "publicRelay": 4001
            })
        );
        assert_eq!(store.snapshot(), hgetalls(1));
    }

    #[tokio::test]
    async fn start_twice_and_stop_before_start_fail() {
        let store = Arc::new(MemoryStore::new());
        let mut checkpoint =
            ConfigCheckpoint::new(store, CONFIG_KEY, None, None, CheckpointConfig::default());
        assert_eq!(checkpoint.stop().unwrap_err().to_string(), "checkpoint not started");

        let _events = checkpoint.start().unwrap();
        assert_eq!(checkpoint.start().unwrap_err().to_string(), "checkpoint already started");
        checkpoint.stop().unwrap();
        assert!(matches!(checkpoint.stop(), Err(GatewayError::NotStarted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn check_ready_polls_without_waiting() {
        let store = Arc::new(MemoryStore::new());
        let config = CheckpointConfig { retry_interval: Duration::from_secs(3600) };
        let mut checkpoint = ConfigCheckpoint::for_template(
            store.clone(),
            CONFIG_KEY,
            HashTemplate::gateway(),
            config,
        );
        let mut events = checkpoint.start().unwrap();
        assert_eq!(events.recv().await.unwrap(), CheckpointEvent::Retry);

        let before = tokio::time::Instant::now();
        store.seed_hash(CONFIG_KEY, [("gateway:imei", "123456789012345")]);
        checkpoint.check_ready();
        assert!(matches!(events.recv().await, Some(CheckpointEvent::Ready(_))));
        assert!(before.elapsed() < Duration::from_secs(1));
        checkpoint.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn store_errors_are_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_with(Some("connection refused"));
        let mut checkpoint = ConfigCheckpoint::new(store.clone(), CONFIG_KEY, None, None, fast());
        let mut events = checkpoint.start().unwrap();
        assert_eq!(events.recv().await.unwrap(), CheckpointEvent::Retry);

        store.fail_with(None);
        assert_eq!(events.recv().await.unwrap(), CheckpointEvent::Ready(Map::new()));
        checkpoint.stop().unwrap();
    }
}
