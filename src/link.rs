//! Framed command/response link over a byte-stream transport
//!
//! Incoming bytes are accumulated and cut into responses that start with a
//! configured prefix and end with a configured suffix. At most one submitted
//! command waits for a response at a time; responses that arrive with no
//! command pending are published to passive observers instead.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

use crate::device::{BoxedReader, BoxedWriter, Transport};
use crate::watcher::{Resource, Watcher, WatcherConfig, WatcherContext};
use crate::{GatewayError, Note, Result, lock};

const READ_BUFFER_SIZE: usize = 1024;
const RESPONSE_CAPACITY: usize = 32;

/// Delimiters wrapped around commands and expected around responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FramingConfig {
    pub command_prefix: String,
    pub command_suffix: String,
    pub response_prefix: String,
    pub response_suffix: String,
}

impl FramingConfig {
    /// Decode each delimiter as JSON string contents, so escapes such as `\r\n`
    /// in configuration become control characters. Values that do not decode
    /// are logged and reset to empty.
    pub fn decoded(self) -> Self {
        Self {
            command_prefix: decode_delimiter(&self.command_prefix),
            command_suffix: decode_delimiter(&self.command_suffix),
            response_prefix: decode_delimiter(&self.response_prefix),
            response_suffix: decode_delimiter(&self.response_suffix),
        }
    }
}

fn decode_delimiter(value: &str) -> String {
    match serde_json::from_str::<String>(&format!("\"{value}\"")) {
        Ok(decoded) => decoded,
        Err(_) => {
            error!("[reader] JSON string contents expected: {}", value);
            String::new()
        }
    }
}

/// Outcome of feeding one chunk to a [`ResponseFramer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// Bytes discarded because no response prefix was found.
    Skip(String),
    /// A response started in this chunk but has not completed.
    Begin,
    /// A response already in progress received more bytes but has not completed.
    Middle,
    /// A complete response, prefix through suffix inclusive.
    Response(String),
}

impl FrameEvent {
    pub fn note(&self) -> Note {
        match self {
            FrameEvent::Skip(_) => Note::Skip,
            FrameEvent::Begin => Note::Begin,
            FrameEvent::Middle => Note::Middle,
            FrameEvent::Response(_) => Note::Response,
        }
    }
}

/// Accumulates bytes and cuts them into prefix/suffix delimited responses.
///
/// An empty response prefix disables framing and every chunk is skipped. An
/// empty suffix completes a response at the end of the chunk that carried it.
#[derive(Debug, Clone)]
pub struct ResponseFramer {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    buffer: Vec<u8>,
    in_response: bool,
}

impl ResponseFramer {
    pub fn new(prefix: &str, suffix: &str) -> Self {
        Self {
            prefix: prefix.as_bytes().to_vec(),
            suffix: suffix.as_bytes().to_vec(),
            buffer: Vec::new(),
            in_response: false,
        }
    }

    /// Drop any partially accumulated response.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_response = false;
    }

    /// Whether a response has begun but not completed.
    pub fn in_response(&self) -> bool {
        self.in_response
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();

        if self.prefix.is_empty() {
            if !chunk.is_empty() {
                events.push(FrameEvent::Skip(String::from_utf8_lossy(chunk).into_owned()));
            }
            return events;
        }

        self.buffer.extend_from_slice(chunk);
        let mut began_here = false;

        loop {
            if !self.in_response {
                match find(&self.buffer, &self.prefix) {
                    Some(start) => {
                        self.buffer.drain(..start);
                        self.in_response = true;
                        began_here = true;
                    }
                    None => {
                        // Keep a tail that could still grow into the prefix.
                        let keep = partial_prefix_len(&self.buffer, &self.prefix);
                        let discard = self.buffer.len() - keep;
                        if discard > 0 {
                            let skipped = String::from_utf8_lossy(&self.buffer[..discard]);
                            events.push(FrameEvent::Skip(skipped.into_owned()));
                            self.buffer.drain(..discard);
                        }
                        break;
                    }
                }
            }

            let body = self.prefix.len();
            let end = if self.suffix.is_empty() {
                Some(self.buffer.len())
            } else {
                find(&self.buffer[body..], &self.suffix).map(|at| body + at + self.suffix.len())
            };

            match end {
                Some(end) => {
                    let response = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
                    self.buffer.drain(..end);
                    self.in_response = false;
                    events.push(FrameEvent::Response(response));
                    if self.buffer.is_empty() {
                        break;
                    }
                }
                None => {
                    events.push(if began_here { FrameEvent::Begin } else { FrameEvent::Middle });
                    break;
                }
            }
        }

        events
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn partial_prefix_len(buffer: &[u8], prefix: &[u8]) -> usize {
    (1..prefix.len()).rev().find(|&len| buffer.ends_with(&prefix[..len])).unwrap_or(0)
}

/// A command paired with the response that completed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub command: String,
    pub response: String,
}

struct PendingCommand {
    command: String,
    reply: oneshot::Sender<CommandResponse>,
}

/// State shared between the link handle and the watcher task.
struct LinkShared {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<Option<PendingCommand>>,
    responses: broadcast::Sender<String>,
}

impl LinkShared {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(GatewayError::NotReady)?;
        writer.write_all(bytes).await.map_err(|e| GatewayError::io_error("write", e))?;
        writer.flush().await.map_err(|e| GatewayError::io_error("flush", e))
    }

    fn complete(&self, response: String) {
        match lock(&self.pending).take() {
            Some(pending) => {
                let _ = pending.reply.send(CommandResponse { command: pending.command, response });
            }
            None => {
                let _ = self.responses.send(response);
            }
        }
    }
}

struct LinkResource {
    transport: Arc<dyn Transport>,
    framer: ResponseFramer,
    shared: Arc<LinkShared>,
}

#[async_trait::async_trait]
impl Resource for LinkResource {
    type Args = ();
    type Handle = BoxedReader;

    async fn open(&mut self, _args: &(), _ctx: &WatcherContext) -> Result<BoxedReader> {
        let streams = self.transport.open().await?;
        self.framer.reset();
        *self.shared.writer.lock().await = Some(streams.writer);
        Ok(streams.reader)
    }

    async fn run(
        &mut self,
        reader: &mut BoxedReader,
        _args: &(),
        ctx: &WatcherContext,
    ) -> Result<()> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await.map_err(|e| GatewayError::io_error("read", e))?;
            if n == 0 {
                return Err(GatewayError::Closed { context: self.transport.describe() });
            }

            for event in self.framer.push(&buf[..n]) {
                match &event {
                    FrameEvent::Skip(data) => info!("[{}] data skipped: {}", ctx.name(), data),
                    FrameEvent::Response(response) => {
                        info!("[{}] response: {:?}", ctx.name(), response)
                    }
                    FrameEvent::Begin | FrameEvent::Middle => {}
                }
                ctx.note(event.note());
                if let FrameEvent::Response(response) = event {
                    self.shared.complete(response);
                }
            }
        }
    }

    async fn close(&mut self, _reader: BoxedReader) {
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        // Dropping the reply sender fails the waiting submitter.
        lock(&self.shared.pending).take();
        debug!("link transport {} closed", self.transport.describe());
    }
}

/// Command/response link supervised by a [`Watcher`].
pub struct FramedLink {
    watcher: Watcher<LinkResource>,
    shared: Arc<LinkShared>,
    config: FramingConfig,
}

impl FramedLink {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: FramingConfig,
        watcher: WatcherConfig,
    ) -> Self {
        Self::named("reader", transport, config, watcher)
    }

    pub fn named(
        name: &'static str,
        transport: Arc<dyn Transport>,
        config: FramingConfig,
        watcher: WatcherConfig,
    ) -> Self {
        let config = config.decoded();
        let (responses, _) = broadcast::channel(RESPONSE_CAPACITY);
        let shared = Arc::new(LinkShared {
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(None),
            responses,
        });
        let resource = LinkResource {
            transport,
            framer: ResponseFramer::new(&config.response_prefix, &config.response_suffix),
            shared: Arc::clone(&shared),
        };
        Self { watcher: Watcher::new(name, resource, watcher), shared, config }
    }

    pub fn config(&self) -> &FramingConfig {
        &self.config
    }

    pub fn start(&mut self) -> Result<&mut Self> {
        self.watcher.start(())?;
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

    pub fn watcher(&self) -> &Watcher<impl Resource> {
        &self.watcher
    }

    /// Subscribe to responses that arrive while no command is pending.
    pub fn responses(&self) -> broadcast::Receiver<String> {
        self.shared.responses.subscribe()
    }

    /// Write a framed command and wait for the response that completes it.
    ///
    /// Fails immediately with [`GatewayError::NotReady`] when the link is down
    /// and [`GatewayError::Busy`] while another command is pending; neither
    /// touches the transport. A write failure is returned without waiting.
    pub async fn submit(&self, command: &str) -> Result<CommandResponse> {
        if !self.watcher.ready() {
            return Err(GatewayError::NotReady);
        }

        let reply = {
            let mut pending = lock(&self.shared.pending);
            if pending.is_some() {
                return Err(GatewayError::Busy);
            }
            let (reply, receiver) = oneshot::channel();
            *pending = Some(PendingCommand { command: command.to_string(), reply });
            receiver
        };

        info!("[{}] command: {:?}", self.watcher.name(), command);
        let framed =
            format!("{}{}{}", self.config.command_prefix, command, self.config.command_suffix);
        if let Err(e) = self.shared.write(framed.as_bytes()).await {
            error!("[{}] write error: {}", self.watcher.name(), e);
            lock(&self.shared.pending).take();
            return Err(e);
        }

        reply.await.map_err(|_| GatewayError::Closed { context: self.watcher.name().to_string() })
    }
}
