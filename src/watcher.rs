//! Generic lifecycle core for supervised resources
//!
//! A [`Watcher`] owns one unreliable resource (a serial modem, a PPP route, a
//! framed command link) and keeps trying to acquire it until it is stopped.
//! The resource-specific behavior lives behind the [`Resource`] trait, so every
//! concrete watcher is a composition of this state machine with its own
//! `open`/`run`/`close` capabilities.
//!
//! ```text
//!   idle ──start──▶ starting ──open ok──▶ ready ──run fails──▶ retrying
//!     ▲                │                                          │
//!     │                └──open fails──▶ retrying ◀──retry timer───┘
//!   stopped ◀──stop── (any started state)
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{GatewayError, Note, Result};

/// Default delay between acquisition attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(5000);

const NOTE_CAPACITY: usize = 64;

/// Lifecycle state of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Idle,
    Starting,
    Retrying,
    Ready,
    Stopped,
}

impl WatcherState {
    /// Whether `stop` is valid (and `start` is not) in this state.
    pub fn is_started(self) -> bool {
        !matches!(self, WatcherState::Idle | WatcherState::Stopped)
    }
}

/// Retry configuration shared by every watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatcherConfig {
    #[serde(with = "millis")]
    pub retry_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { retry_interval: DEFAULT_RETRY_INTERVAL }
    }
}

impl WatcherConfig {
    pub fn with_retry_interval(retry_interval: Duration) -> Self {
        Self { retry_interval }
    }
}

/// Serde adapter for durations expressed in milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Handle given to a [`Resource`] while it runs inside the watcher task.
///
/// Readiness changes made through a context whose watcher has been stopped are
/// ignored, so late I/O completions cannot resurrect a stopped watcher.
#[derive(Clone)]
pub struct WatcherContext {
    name: &'static str,
    state: Arc<watch::Sender<WatcherState>>,
    notes: broadcast::Sender<Note>,
    check: Arc<Notify>,
    cancel: CancellationToken,
}

impl WatcherContext {
    /// Component name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Publish a note to subscribers.
    pub fn note(&self, note: Note) {
        let _ = self.notes.send(note);
    }

    /// Flip between `ready` and `retrying`.
    pub fn set_ready(&self, ready: bool) {
        self.set_state(if ready { WatcherState::Ready } else { WatcherState::Retrying });
    }

    /// Current readiness.
    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == WatcherState::Ready
    }

    /// Resolves when an owner calls [`Watcher::check_ready`].
    pub async fn check_requested(&self) {
        self.check.notified().await
    }

    /// Whether the owning watcher has been stopped.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_state(&self, next: WatcherState) {
        let cancel = &self.cancel;
        self.state.send_if_modified(|state| {
            if cancel.is_cancelled() || *state == WatcherState::Stopped || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }
}

/// Resource-specific capabilities plugged into a [`Watcher`].
#[async_trait::async_trait]
pub trait Resource: Send + 'static {
    /// Arguments supplied on every `start`.
    type Args: Send + Sync + 'static;

    /// Acquired resource, released through [`Resource::close`].
    type Handle: Send;

    /// Acquire the resource.
    ///
    /// An error is reported as a `retry` note and another attempt is made
    /// after the retry interval.
    async fn open(&mut self, args: &Self::Args, ctx: &WatcherContext) -> Result<Self::Handle>;

    /// Drive the acquired resource.
    ///
    /// Returning `Err` reports an `error` note, closes the handle and schedules
    /// reacquisition; returning `Ok` closes and reacquires without a note. The
    /// future is dropped when the watcher stops.
    async fn run(
        &mut self,
        handle: &mut Self::Handle,
        args: &Self::Args,
        ctx: &WatcherContext,
    ) -> Result<()>;

    /// Release the resource. Called exactly once per successful `open`.
    async fn close(&mut self, handle: Self::Handle);

    /// Whether a successful `open` alone makes the watcher ready. Resources
    /// that converge over several cycles return `false` and call
    /// [`WatcherContext::set_ready`] themselves.
    fn ready_on_open(&self) -> bool {
        true
    }
}

/// Start/stop/retry/ready state machine around a [`Resource`].
pub struct Watcher<R: Resource> {
    name: &'static str,
    config: WatcherConfig,
    resource: Arc<Mutex<R>>,
    state: Arc<watch::Sender<WatcherState>>,
    notes: broadcast::Sender<Note>,
    check: Arc<Notify>,
    cancel: Option<CancellationToken>,
}

impl<R: Resource> Watcher<R> {
    pub fn new(name: &'static str, resource: R, config: WatcherConfig) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        let (notes, _) = broadcast::channel(NOTE_CAPACITY);
        Self {
            name,
            config,
            resource: Arc::new(Mutex::new(resource)),
            state: Arc::new(state),
            notes,
            check: Arc::new(Notify::new()),
            cancel: None,
        }
    }

    /// Begin acquiring the resource in a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, args: R::Args) -> Result<&mut Self> {
        if self.started() {
            return Err(GatewayError::AlreadyStarted { component: self.name });
        }

        info!("[{}] start watching", self.name);

        let cancel = CancellationToken::new();
        let ctx = WatcherContext {
            name: self.name,
            state: Arc::clone(&self.state),
            notes: self.notes.clone(),
            check: Arc::clone(&self.check),
            cancel: cancel.clone(),
        };
        self.state.send_replace(WatcherState::Starting);

        let resource = Arc::clone(&self.resource);
        let retry_interval = self.config.retry_interval;
        tokio::spawn(async move {
            supervise(resource, args, ctx, retry_interval).await;
        });

        self.cancel = Some(cancel);
        Ok(self)
    }

    /// Release the resource and cancel any pending retry.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started() {
            return Err(GatewayError::NotStarted { component: self.name });
        }

        info!("[{}] stop watching", self.name);

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.state.send_replace(WatcherState::Stopped);
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.state().is_started()
    }

    pub fn ready(&self) -> bool {
        self.state() == WatcherState::Ready
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Ask the running resource to re-evaluate readiness.
    ///
    /// Resources that never wait on [`WatcherContext::check_requested`] treat
    /// this as a no-op.
    pub fn check_ready(&self) {
        self.check.notify_one();
    }

    /// Subscribe to notes. Only notes published after this call are received.
    pub fn notes(&self) -> broadcast::Receiver<Note> {
        self.notes.subscribe()
    }

    /// Notes as a stream, skipping over any lagged gaps.
    pub fn note_stream(&self) -> impl Stream<Item = Note> + 'static {
        BroadcastStream::new(self.notes.subscribe()).filter_map(|note| async move { note.ok() })
    }

    /// Receiver for state transitions.
    pub fn state_changes(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Wait until the watcher reports `ready`.
    pub async fn wait_ready(&self) {
        let mut states = self.state.subscribe();
        let _ = states.wait_for(|state| *state == WatcherState::Ready).await;
    }

    pub(crate) fn emit(&self, note: Note) {
        let _ = self.notes.send(note);
    }
}

impl<R: Resource> Drop for Watcher<R> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!("[{}] dropping started watcher", self.name);
            cancel.cancel();
        }
    }
}

/// Acquire, drive, release, retry; until cancelled.
async fn supervise<R: Resource>(
    resource: Arc<Mutex<R>>,
    args: R::Args,
    ctx: WatcherContext,
    retry_interval: Duration,
) {
    // A previous run may still be closing; wait for it to hand the resource back.
    let mut resource = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        guard = resource.lock_owned() => guard,
    };

    loop {
        let opened = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            opened = resource.open(&args, &ctx) => opened,
        };

        match opened {
            Ok(mut handle) => {
                if resource.ready_on_open() {
                    info!("[{}] ready", ctx.name);
                    ctx.set_ready(true);
                    ctx.note(Note::Ready);
                }

                let outcome = tokio::select! {
                    _ = ctx.cancel.cancelled() => None,
                    outcome = resource.run(&mut handle, &args, &ctx) => Some(outcome),
                };
                resource.close(handle).await;

                match outcome {
                    None => break,
                    Some(Ok(())) => debug!("[{}] resource released", ctx.name),
                    Some(Err(e)) => {
                        error!("[{}] read error: {}", ctx.name, e);
                        ctx.note(Note::Error);
                    }
                }
                ctx.set_ready(false);
            }
            Err(e) => {
                warn!("[{}] retry: {}", ctx.name, e);
                ctx.set_state(WatcherState::Retrying);
                ctx.note(Note::Retry);
            }
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }

    debug!("[{}] watcher task ended", ctx.name);
}
