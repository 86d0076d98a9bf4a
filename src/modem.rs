//! Modem supervision over a serial AT-command device
//!
//! The modem's report port is read line by line. Unsolicited flow reports and
//! signal-quality answers become typed [`ModemEvent`]s, and the IMEI is picked
//! out of the doubled `AT+CGSN` echo sent on every (re)connect.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::device::{BoxedReader, BoxedWriter, SerialDevice, Transport};
use crate::watcher::{Resource, Watcher, WatcherConfig, WatcherContext, millis};
use crate::{GatewayError, Note, Result, lock};

/// Huawei `^DSFLOWRPT:<time>,<tx_rate>,<rx_rate>,<tx_flow>,<rx_flow>,<qos_tx>,<qos_rx>`
pub const FLOW_REPORT_TAG: &str = "^DSFLOWRPT:";
/// Huawei `+CSQ: <rssi>,<ber>`
pub const RSSI_REPORT_TAG: &str = "+CSQ:";

pub const IMEI_REQUEST: &str = "AT+CGSN\nAT+CGSN\n";
pub const RSSI_REQUEST: &str = "AT+CSQ\n";

const READ_BUFFER_SIZE: usize = 512;
const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModemConfig {
    pub report_file: PathBuf,
    pub command_file: PathBuf,
    #[serde(with = "millis")]
    pub rssi_interval: Duration,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            report_file: PathBuf::from("/dev/ttyUSB2"),
            command_file: PathBuf::from("/dev/ttyUSB2"),
            rssi_interval: Duration::from_secs(60),
        }
    }
}

impl ModemConfig {
    pub fn device(&self) -> SerialDevice {
        SerialDevice::split(&self.report_file, &self.command_file)
    }
}

/// Decoded `^DSFLOWRPT` counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowReport {
    pub txrate: u64,
    pub rxrate: u64,
    pub txflow: u64,
    pub rxflow: u64,
    pub txqos: u64,
    pub rxqos: u64,
}

impl FlowReport {
    /// Parse the text following the report tag. The first field is the
    /// connection time and is ignored; the next six are hexadecimal.
    pub fn parse(data: &str) -> Result<Self> {
        let parts: Vec<&str> = data.split(',').collect();
        let field = |index: usize, name: &'static str| -> Result<u64> {
            let text = parts.get(index).map(|part| part.trim()).unwrap_or_default();
            u64::from_str_radix(text, 16)
                .map_err(|_| GatewayError::InvalidValue { field: name, value: text.to_string() })
        };

        Ok(Self {
            txrate: field(1, "txrate")?,
            rxrate: field(2, "rxrate")?,
            txflow: field(3, "txflow")?,
            rxflow: field(4, "rxflow")?,
            txqos: field(5, "txqos")?,
            rxqos: field(6, "rxqos")?,
        })
    }

    /// Counters rendered as gauge samples.
    pub fn gauges(&self) -> [(&'static str, String); 6] {
        let gauge = |value: u64| format!("{value}|g");
        [
            ("txrate", gauge(self.txrate)),
            ("rxrate", gauge(self.rxrate)),
            ("txflow", gauge(self.txflow)),
            ("rxflow", gauge(self.rxflow)),
            ("txqos", gauge(self.txqos)),
            ("rxqos", gauge(self.rxqos)),
        ]
    }
}

/// Parse the text following `+CSQ:`; negative readings clamp to zero.
pub fn parse_rssi(data: &str) -> Result<u32> {
    let text = data.split(',').next().unwrap_or_default().trim();
    let rssi: i64 = text
        .parse()
        .map_err(|_| GatewayError::InvalidValue { field: "rssi", value: text.to_string() })?;
    Ok(rssi.clamp(0, i64::from(u32::MAX)) as u32)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemEvent {
    Flow(FlowReport),
    Rssi(u32),
    Imei(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImeiResolution {
    Resolved(String),
    Unknown,
}

/// Picks the IMEI out of the echo of two consecutive `AT+CGSN` commands.
///
/// Candidates alternate between a 15-digit line and `OK`; lines that do not
/// fit the next slot are ignored. After four candidates the IMEI is either the
/// repeated digits or `unknown`, and later lines are not considered.
#[derive(Debug, Default)]
pub struct ImeiTracker {
    candidates: Vec<String>,
    imei: Option<String>,
}

impl ImeiTracker {
    pub const UNKNOWN: &'static str = "unknown";

    pub fn reset(&mut self) {
        self.candidates.clear();
        self.imei = None;
    }

    pub fn imei(&self) -> Option<&str> {
        self.imei.as_deref()
    }

    pub fn consider(&mut self, line: &str) -> Option<ImeiResolution> {
        if self.imei.is_some() {
            return None;
        }

        let expected = if self.candidates.len() % 2 == 1 { line == "OK" } else { is_imei(line) };
        if !expected {
            return None;
        }
        self.candidates.push(line.to_string());
        if self.candidates.len() < 4 {
            return None;
        }

        let c = &self.candidates;
        if c[0] == c[2] && c[1] == "OK" && c[3] == "OK" {
            self.imei = Some(c[0].clone());
            Some(ImeiResolution::Resolved(c[0].clone()))
        } else {
            self.imei = Some(Self::UNKNOWN.to_string());
            Some(ImeiResolution::Unknown)
        }
    }
}

fn is_imei(line: &str) -> bool {
    line.len() == 15 && line.bytes().all(|b| b.is_ascii_digit())
}

/// Cuts a byte stream into lines, holding an incomplete tail until its newline
/// arrives. Trailing `\r` is stripped and empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..end]);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

struct ModemShared {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    imei: Mutex<ImeiTracker>,
    events: broadcast::Sender<ModemEvent>,
}

impl ModemShared {
    async fn request(&self, ctx: &WatcherContext, command: &str, note: Note) {
        let written = async {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(GatewayError::NotReady)?;
            writer.write_all(command.as_bytes()).await?;
            writer.flush().await?;
            Ok::<_, GatewayError>(())
        };
        match written.await {
            Ok(()) => ctx.note(note),
            Err(e) => {
                error!("[{}] request error: {}", ctx.name(), e);
                ctx.note(Note::Error);
            }
        }
    }

    fn handle_line(&self, ctx: &WatcherContext, line: &str) {
        if let Some(data) = line.strip_prefix(FLOW_REPORT_TAG) {
            debug!("[{}] FLOW: {}", ctx.name(), data);
            match FlowReport::parse(data) {
                Ok(report) => self.publish(ModemEvent::Flow(report)),
                Err(e) => {
                    error!("[{}] flow error: {}", ctx.name(), e);
                    ctx.note(Note::Error);
                }
            }
        } else if let Some(data) = line.strip_prefix(RSSI_REPORT_TAG) {
            info!("[{}] RSSI:{}", ctx.name(), data);
            match parse_rssi(data) {
                Ok(rssi) => self.publish(ModemEvent::Rssi(rssi)),
                Err(e) => {
                    error!("[{}] rssi error: {}", ctx.name(), e);
                    ctx.note(Note::Error);
                }
            }
        } else {
            let resolution = lock(&self.imei).consider(line);
            match resolution {
                Some(ImeiResolution::Resolved(imei)) => {
                    info!("[{}] IMEI: {}", ctx.name(), imei);
                    self.publish(ModemEvent::Imei(imei));
                }
                Some(ImeiResolution::Unknown) => {
                    error!("[{}] IMEI could not be determined", ctx.name());
                    ctx.note(Note::Error);
                }
                None => {}
            }
        }
    }

    fn publish(&self, event: ModemEvent) {
        let _ = self.events.send(event);
    }
}

struct ModemResource {
    transport: Arc<dyn Transport>,
    rssi_interval: Duration,
    shared: Arc<ModemShared>,
}

#[async_trait::async_trait]
impl Resource for ModemResource {
    type Args = ();
    type Handle = BoxedReader;

    async fn open(&mut self, _args: &(), _ctx: &WatcherContext) -> Result<BoxedReader> {
        let streams = self.transport.open().await?;
        *self.shared.writer.lock().await = Some(streams.writer);
        Ok(streams.reader)
    }

    async fn run(
        &mut self,
        reader: &mut BoxedReader,
        _args: &(),
        ctx: &WatcherContext,
    ) -> Result<()> {
        self.shared.request(ctx, IMEI_REQUEST, Note::RequestImei).await;
        self.shared.request(ctx, RSSI_REQUEST, Note::RequestRssi).await;

        let mut poll =
            tokio::time::interval_at(Instant::now() + self.rssi_interval, self.rssi_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut lines = LineBuffer::default();
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = read.map_err(|e| GatewayError::io_error("read", e))?;
                    if n == 0 {
                        return Err(GatewayError::Closed { context: self.transport.describe() });
                    }
                    for line in lines.push(&buf[..n]) {
                        self.shared.handle_line(ctx, &line);
                    }
                }
                _ = poll.tick() => {
                    self.shared.request(ctx, RSSI_REQUEST, Note::RequestRssi).await;
                }
            }
        }
    }

    async fn close(&mut self, _reader: BoxedReader) {
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!("modem device {} closed", self.transport.describe());
    }
}

/// Keeps the modem's report port open and tracks IMEI, signal and traffic.
pub struct ModemWatcher {
    watcher: Watcher<ModemResource>,
    shared: Arc<ModemShared>,
}

impl ModemWatcher {
    /// Watch the serial device named by `config`.
    pub fn from_config(config: &ModemConfig, watcher: WatcherConfig) -> Self {
        Self::new(Arc::new(config.device()), config.rssi_interval, watcher)
    }

    pub fn new(
        transport: Arc<dyn Transport>,
        rssi_interval: Duration,
        watcher: WatcherConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(ModemShared {
            writer: tokio::sync::Mutex::new(None),
            imei: Mutex::new(ImeiTracker::default()),
            events,
        });
        let resource = ModemResource { transport, rssi_interval, shared: Arc::clone(&shared) };
        Self { watcher: Watcher::new("modem", resource, watcher), shared }
    }

    /// Open the device and forget any previously resolved IMEI.
    pub fn start(&mut self) -> Result<&mut Self> {
        if self.watcher.started() {
            return Err(GatewayError::AlreadyStarted { component: self.watcher.name() });
        }
        lock(&self.shared.imei).reset();
        self.watcher.start(())?;
        Ok(self)
    }

    /// Close the device; RSSI polling ends with the read task.
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

    pub fn notes(&self) -> broadcast::Receiver<Note> {
        self.watcher.notes()
    }

    pub fn events(&self) -> broadcast::Receiver<ModemEvent> {
        self.shared.events.subscribe()
    }

    /// Resolved IMEI, `unknown` if the handshake failed, `None` before it ends.
    pub fn imei(&self) -> Option<String> {
        lock(&self.shared.imei).imei().map(str::to_string)
    }
}
