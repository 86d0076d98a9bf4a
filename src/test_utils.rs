//! Test doubles for transports and shell commands, plus captured command output
//! used across the gateway test suites.

#![cfg(test)]

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use crate::device::{Transport, TransportStreams};
use crate::shell::{Shell, ShellOutput};
use crate::{GatewayError, Result, lock};

const DUPLEX_BUFFER: usize = 4096;

/// Transport backed by in-memory pipes. Every successful open hands the far
/// end of a fresh pipe to the test through the returned receiver.
pub struct DuplexTransport {
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl DuplexTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, receiver) = mpsc::unbounded_channel();
        (Self { peers }, receiver)
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    fn describe(&self) -> String {
        "duplex".to_string()
    }

    async fn open(&self) -> Result<TransportStreams> {
        let (near, far) = tokio::io::duplex(DUPLEX_BUFFER);
        self.peers.send(far).map_err(|_| GatewayError::Closed { context: "test peer".into() })?;
        let (reader, writer) = tokio::io::split(near);
        Ok(TransportStreams::new(reader, writer))
    }
}

/// Transport whose open always fails.
pub struct FailingTransport {
    reason: String,
}

impl FailingTransport {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait::async_trait]
impl Transport for FailingTransport {
    fn describe(&self) -> String {
        "failing".to_string()
    }

    async fn open(&self) -> Result<TransportStreams> {
        Err(GatewayError::io_error("connect", std::io::Error::other(self.reason.clone())))
    }
}

/// Transport that opens fine but rejects every write. Reads never complete,
/// so the link stays ready.
pub struct BrokenWriteTransport;

struct SilentReader;

impl AsyncRead for SilentReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

struct BrokenWriter;

impl AsyncWrite for BrokenWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait::async_trait]
impl Transport for BrokenWriteTransport {
    fn describe(&self) -> String {
        "broken write".to_string()
    }

    async fn open(&self) -> Result<TransportStreams> {
        Ok(TransportStreams::new(SilentReader, BrokenWriter))
    }
}

/// Shell that answers from a lookup table and records every command it runs.
#[derive(Default)]
pub struct ScriptedShell {
    lookup: Mutex<HashMap<String, (i32, String)>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, command: &str, code: i32, output: &str) {
        lock(&self.lookup).insert(command.to_string(), (code, output.to_string()));
    }

    /// Commands run since the last snapshot.
    pub fn snapshot(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.executed))
    }
}

#[async_trait::async_trait]
impl Shell for ScriptedShell {
    async fn exec(&self, command: &str) -> Result<ShellOutput> {
        let answer = lock(&self.lookup).get(command).cloned();
        match answer {
            Some((code, output)) => {
                lock(&self.executed).push(command.to_string());
                Ok(ShellOutput { code, output })
            }
            None => Err(GatewayError::io_error(
                command,
                std::io::Error::other(format!("no response found: {command}")),
            )),
        }
    }
}

pub const PPPSTATS_HEADER: &str =
    "IN   PACK VJCOMP  VJUNC  VJERR  |      OUT   PACK VJCOMP  VJUNC NON-VJ";

pub const PPPSTATS_MISSING: &str = "pppstats: nonexistent interface 'ppp0' specified";

pub const ROUTE_WITHOUT_PPP: &str = "\
Kernel IP routing table
Destination     Gateway         Genmask         Flags Metric Ref    Use Iface
0.0.0.0         192.168.1.1     0.0.0.0         UG    0      0        0 eth0
192.168.1.0     0.0.0.0         255.255.255.0   U     0      0        0 eth0
";

pub const ROUTE_WITH_PPP: &str = "\
Kernel IP routing table
Destination     Gateway         Genmask         Flags Metric Ref    Use Iface
0.0.0.0         192.168.1.1     0.0.0.0         UG    0      0        0 eth0
172.29.12.0     0.0.0.0         255.255.255.0   U     0      0        0 ppp0
192.168.1.0     0.0.0.0         255.255.255.0   U     0      0        0 eth0
";
