//! Byte-stream transports
//!
//! A transport yields a reader and a writer each time it is opened. The
//! watcher that owns it decides when to open, how long to read, and when to
//! give up and reopen.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::{GatewayError, Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reader and writer halves of an opened transport.
pub struct TransportStreams {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl TransportStreams {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self { reader: Box::new(reader), writer: Box::new(writer) }
    }
}

/// Something that can be opened into a byte stream.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;

    /// Open the transport. Failures are retried by the owning watcher.
    async fn open(&self) -> Result<TransportStreams>;
}

/// Local character device, read from one path and written to another
/// (usually the same tty).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialDevice {
    pub in_file: PathBuf,
    pub out_file: PathBuf,
}

impl SerialDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self { in_file: path.clone(), out_file: path }
    }

    pub fn split(in_file: impl Into<PathBuf>, out_file: impl Into<PathBuf>) -> Self {
        Self { in_file: in_file.into(), out_file: out_file.into() }
    }
}

#[async_trait::async_trait]
impl Transport for SerialDevice {
    fn describe(&self) -> String {
        if self.in_file == self.out_file {
            self.in_file.display().to_string()
        } else {
            format!("{} -> {}", self.in_file.display(), self.out_file.display())
        }
    }

    async fn open(&self) -> Result<TransportStreams> {
        debug!("opening serial device {}", self.describe());

        let reader = tokio::fs::OpenOptions::new()
            .read(true)
            .open(&self.in_file)
            .await
            .map_err(|e| GatewayError::io_error(format!("open {}", self.in_file.display()), e))?;
        let writer = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.out_file)
            .await
            .map_err(|e| GatewayError::io_error(format!("open {}", self.out_file.display()), e))?;

        Ok(TransportStreams::new(reader, writer))
    }
}

/// Host and port reached over TCP, telnet style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelnetDevice {
    pub telnet_address: String,
    pub telnet_port: u16,
}

impl TelnetDevice {
    pub fn new(telnet_address: impl Into<String>, telnet_port: u16) -> Self {
        Self { telnet_address: telnet_address.into(), telnet_port }
    }
}

#[async_trait::async_trait]
impl Transport for TelnetDevice {
    fn describe(&self) -> String {
        format!("{}:{}", self.telnet_address, self.telnet_port)
    }

    async fn open(&self) -> Result<TransportStreams> {
        debug!("connecting to {}", self.describe());

        let stream =
            tokio::net::TcpStream::connect((self.telnet_address.as_str(), self.telnet_port))
                .await
                .map_err(|e| GatewayError::io_error(format!("connect {}", self.describe()), e))?;
        let (reader, writer) = stream.into_split();
        Ok(TransportStreams::new(reader, writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn telnet_device_connects_and_exchanges_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = TelnetDevice::new("127.0.0.1", port);
        assert_eq!(device.describe(), format!("127.0.0.1:{port}"));

        let (opened, accepted) = tokio::join!(device.open(), listener.accept());
        let mut streams = opened.unwrap();
        let (mut peer, _) = accepted.unwrap();

        streams.writer.write_all(b"AT\n").await.unwrap();
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AT\n");

        peer.write_all(b"OK\n").await.unwrap();
        let mut buf = [0u8; 3];
        streams.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OK\n");
    }

    #[tokio::test]
    async fn missing_serial_device_is_a_retryable_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let device = SerialDevice::new(dir.path().join("ttyUSB9"));

        let err = device.open().await.err().unwrap();
        assert!(matches!(err, GatewayError::Io { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn serial_device_opens_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::write(&input, b"+CSQ: 17,99\n").unwrap();
        std::fs::write(&output, b"").unwrap();

        let device = SerialDevice::split(&input, &output);
        let mut streams = device.open().await.unwrap();
        let mut text = String::new();
        streams.reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "+CSQ: 17,99\n");

        streams.writer.write_all(b"AT+CSQ\n").await.unwrap();
        streams.writer.flush().await.unwrap();
        drop(streams);
        assert_eq!(std::fs::read(&output).unwrap(), b"AT+CSQ\n");
    }
}
