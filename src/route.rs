//! PPP route supervision
//!
//! Readiness here is not event driven: every cycle inspects `pppstats` and the
//! kernel route table, dials or adds the missing route, and only declares the
//! watcher ready once a later cycle observes the route in place.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};

use crate::shell::{OutputCache, Shell};
use crate::watcher::{Resource, Watcher, WatcherConfig, WatcherContext, millis};
use crate::{GatewayError, Note, Result};

pub const PPPSTATS_COMMAND: &str = "pppstats";
pub const ROUTE_COMMAND: &str = "route -n";
pub const DIAL_COMMAND: &str = "pppd";

const PPPSTATS_HEADER_MARK: &str = "PACK VJCOMP  VJUNC";
const MISSING_INTERFACE_MARK: &str = "nonexistent interface";

/// PPP peer network and how often to check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PppConfig {
    pub subnet: String,
    pub mask: String,
    pub interface: String,
    #[serde(with = "millis")]
    pub route_interval: Duration,
}

impl Default for PppConfig {
    fn default() -> Self {
        Self {
            subnet: "172.29.12.0".to_string(),
            mask: "255.255.255.0".to_string(),
            interface: "ppp0".to_string(),
            route_interval: Duration::from_secs(15),
        }
    }
}

impl PppConfig {
    pub fn route_add_command(&self) -> String {
        format!("route add -net {} netmask {} dev {}", self.subnet, self.mask, self.interface)
    }
}

/// Result of one convergence cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    /// The PPP interface was missing and the dialer was launched.
    Dialing,
    /// The route to the PPP subnet was missing and has been added.
    RouteAdded,
    /// The route to the PPP subnet is present.
    Ready,
    /// A status command failed or produced unexpected output.
    Error,
}

impl RouteStatus {
    pub fn note(self) -> Note {
        match self {
            RouteStatus::Dialing => Note::Pppd,
            RouteStatus::RouteAdded => Note::Route,
            RouteStatus::Ready => Note::Ready,
            RouteStatus::Error => Note::Error,
        }
    }
}

/// Runs the status commands and converges the route table.
pub struct RouteChecker {
    cache: OutputCache,
}

impl RouteChecker {
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { cache: OutputCache::new(shell) }
    }

    pub async fn check_routes(&mut self, ppp: &PppConfig) -> RouteStatus {
        let stats = match self.pppstats_output(true).await {
            Ok(stats) => stats,
            Err(GatewayError::Shell { output, .. }) if output.contains(MISSING_INTERFACE_MARK) => {
                info!("[pppd] starting pppd");
                self.run_mutation(DIAL_COMMAND).await;
                return RouteStatus::Dialing;
            }
            Err(e) => {
                error!("[pppd] pppstats error: {}", e);
                return RouteStatus::Error;
            }
        };

        if !stats.contains(PPPSTATS_HEADER_MARK) {
            error!("[pppd] unexpected pppstats output: {}", stats);
            return RouteStatus::Error;
        }

        let routes = match self.route_output(true).await {
            Ok(routes) => routes,
            Err(e) => {
                error!("[pppd] route error: {}", e);
                return RouteStatus::Error;
            }
        };

        if has_route(&routes, &ppp.subnet) {
            RouteStatus::Ready
        } else {
            info!("[pppd] add ppp route to {}", ppp.subnet);
            self.run_mutation(&ppp.route_add_command()).await;
            RouteStatus::RouteAdded
        }
    }

    pub async fn pppstats_output(&mut self, refresh: bool) -> Result<String> {
        self.cache.get("pppstats", PPPSTATS_COMMAND, refresh).await
    }

    pub async fn route_output(&mut self, refresh: bool) -> Result<String> {
        self.cache.get("route", ROUTE_COMMAND, refresh).await
    }

    pub async fn get_shell_output(
        &mut self,
        key: &str,
        command: &str,
        refresh: bool,
    ) -> Result<String> {
        self.cache.get(key, command, refresh).await
    }

    /// Fire a mutating command; its outcome is observed on the next cycle.
    async fn run_mutation(&self, command: &str) {
        match self.cache.shell().exec(command).await {
            Ok(result) if result.code != 0 => {
                warn!("[pppd] '{}' exited with {}: {}", command, result.code, result.output.trim())
            }
            Ok(_) => {}
            Err(e) => warn!("[pppd] '{}' failed: {}", command, e),
        }
    }
}

fn has_route(routes: &str, subnet: &str) -> bool {
    routes.lines().any(|line| line.split_whitespace().next() == Some(subnet))
}

struct RouteResource {
    checker: Arc<Mutex<RouteChecker>>,
}

#[async_trait::async_trait]
impl Resource for RouteResource {
    type Args = PppConfig;
    type Handle = ();

    async fn open(&mut self, _ppp: &PppConfig, _ctx: &WatcherContext) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _handle: &mut (), ppp: &PppConfig, ctx: &WatcherContext) -> Result<()> {
        loop {
            let status = self.checker.lock().await.check_routes(ppp).await;
            ctx.set_ready(status == RouteStatus::Ready);
            ctx.note(status.note());
            tokio::time::sleep(ppp.route_interval).await;
        }
    }

    async fn close(&mut self, _handle: ()) {}

    fn ready_on_open(&self) -> bool {
        false
    }
}

/// Keeps a PPP link dialed and routed.
pub struct RouteWatcher {
    watcher: Watcher<RouteResource>,
    checker: Arc<Mutex<RouteChecker>>,
}

impl RouteWatcher {
    pub fn new(shell: Arc<dyn Shell>, config: WatcherConfig) -> Self {
        let checker = Arc::new(Mutex::new(RouteChecker::new(shell)));
        let resource = RouteResource { checker: Arc::clone(&checker) };
        Self { watcher: Watcher::new("pppd", resource, config), checker }
    }

    pub fn start(&mut self, ppp: PppConfig) -> Result<&mut Self> {
        self.watcher.start(ppp)?;
        Ok(self)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.watcher.stop()
    }

    pub fn started(&self) -> bool {
        self.watcher.started()
    }

    pub fn ready(&self) -> bool {
        self.watcher.ready()
    }

    /// Readiness follows the check cycle only; owners cannot force it.
    pub fn check_ready(&self) {}

    pub fn notes(&self) -> broadcast::Receiver<Note> {
        self.watcher.notes()
    }

    /// Run one convergence cycle outside the timer and publish its note.
    /// Readiness is left to the running watcher.
    pub async fn check_routes(&self, ppp: &PppConfig) -> RouteStatus {
        let status = self.checker.lock().await.check_routes(ppp).await;
        self.watcher.emit(status.note());
        status
    }

    pub async fn get_shell_output(
        &self,
        key: &str,
        command: &str,
        refresh: bool,
    ) -> Result<String> {
        self.checker.lock().await.get_shell_output(key, command, refresh).await
    }
}
