//! Datagram relay between the field side and the private/public paths
//!
//! Three UDP sockets are owned by one task:
//!
//! - `outside` receives M2M messages, which are decoded and queued in the
//!   store, and sends everything relayed to a path's remote host.
//! - `private` and `public` listen on their relay ports; whatever arrives is
//!   forwarded unmodified through `outside` to that path's host and port.
//!
//! Datagrams are handled one at a time in arrival order.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::KeyValueStore;
use crate::store::schema::{
    ACK_QUEUE_KEY, COMMAND_QUEUE_KEY, LAST_PRIVATE_TIMESTAMP_KEY, LAST_TIMESTAMP_KEY,
};
use crate::wire::{MOBILE_TERMINATED_ACK, MOBILE_TERMINATED_EVENT, WireMessage};
use crate::{GatewayError, Result, lock};

const COMPONENT: &str = "proxy";
const MAX_DATAGRAM: usize = 65_507;
const EVENT_CAPACITY: usize = 64;

/// Network path a datagram is relayed over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Path {
    Private,
    #[default]
    Public,
}

impl Path {
    pub fn name(self) -> &'static str {
        match self {
            Path::Private => "private",
            Path::Public => "public",
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn default_private_relay() -> u16 {
    4000
}

fn default_public_relay() -> u16 {
    4001
}

/// Relay addressing, fixed for the lifetime of one proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub primary: Path,
    pub private_host: String,
    pub private_port: u16,
    #[serde(default = "default_private_relay")]
    pub private_relay: u16,
    pub public_host: String,
    pub public_port: u16,
    #[serde(default = "default_public_relay")]
    pub public_relay: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,
}

impl GatewayConfig {
    /// Remote host and port datagrams relayed over `path` are sent to.
    pub fn destination(&self, path: Path) -> (&str, u16) {
        match path {
            Path::Private => (&self.private_host, self.private_port),
            Path::Public => (&self.public_host, self.public_port),
        }
    }

    pub fn relay_port(&self, path: Path) -> u16 {
        match path {
            Path::Private => self.private_relay,
            Path::Public => self.public_relay,
        }
    }
}

/// Local binding for the proxy's sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxySettings {
    pub bind_address: IpAddr,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self { bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED) }
    }
}

/// What happened to one datagram received on the outside socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Mobile-terminated event pushed onto the command queue.
    Command,
    /// Acknowledgement pushed onto the ack queue.
    RelayAck(u16),
    /// Acknowledgement matched the armed hint and was dropped.
    IgnoreAck(u16),
    CrcError,
    DecodeError,
    UnexpectedType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEvent {
    /// A datagram was relayed over a path and its bookkeeping recorded.
    Send(Path),
    Inbound(InboundOutcome),
}

/// Counters since the proxy started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStats {
    pub received: u64,
    pub commands: u64,
    pub relayed_acks: u64,
    pub ignored_acks: u64,
    pub crc_errors: u64,
    pub decode_errors: u64,
    pub unexpected_types: u64,
    pub sent_private: u64,
    pub sent_public: u64,
    pub send_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    commands: AtomicU64,
    relayed_acks: AtomicU64,
    ignored_acks: AtomicU64,
    crc_errors: AtomicU64,
    decode_errors: AtomicU64,
    unexpected_types: AtomicU64,
    sent_private: AtomicU64,
    sent_public: AtomicU64,
    send_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn inbound(&self, outcome: InboundOutcome) {
        Self::bump(match outcome {
            InboundOutcome::Command => &self.commands,
            InboundOutcome::RelayAck(_) => &self.relayed_acks,
            InboundOutcome::IgnoreAck(_) => &self.ignored_acks,
            InboundOutcome::CrcError => &self.crc_errors,
            InboundOutcome::DecodeError => &self.decode_errors,
            InboundOutcome::UnexpectedType(_) => &self.unexpected_types,
        });
    }

    fn snapshot(&self) -> ProxyStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ProxyStats {
            received: load(&self.received),
            commands: load(&self.commands),
            relayed_acks: load(&self.relayed_acks),
            ignored_acks: load(&self.ignored_acks),
            crc_errors: load(&self.crc_errors),
            decode_errors: load(&self.decode_errors),
            unexpected_types: load(&self.unexpected_types),
            sent_private: load(&self.sent_private),
            sent_public: load(&self.sent_public),
            send_errors: load(&self.send_errors),
        }
    }
}

/// Local addresses the proxy's sockets are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyAddrs {
    pub outside: SocketAddr,
    pub private: SocketAddr,
    pub public: SocketAddr,
}

struct ProxyShared {
    config: GatewayConfig,
    store: Arc<dyn KeyValueStore>,
    outside: Mutex<Option<Arc<UdpSocket>>>,
    ack_hint: Mutex<Option<u16>>,
    events: broadcast::Sender<ProxyEvent>,
    counters: Counters,
}

impl ProxyShared {
    fn publish(&self, event: ProxyEvent) {
        let _ = self.events.send(event);
    }

    async fn receive_outside(&self, data: &[u8], from: SocketAddr) {
        info!(size = data.len(), %from, "[outside] incoming");
        Counters::bump(&self.counters.received);

        let outcome = match WireMessage::from_wire(data) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                error!("[{}] enqueue error: {}", COMPONENT, e);
                match e {
                    GatewayError::Crc { .. } => InboundOutcome::CrcError,
                    _ => InboundOutcome::DecodeError,
                }
            }
        };

        self.counters.inbound(outcome);
        self.publish(ProxyEvent::Inbound(outcome));
    }

    async fn dispatch(&self, message: WireMessage) -> InboundOutcome {
        match message.message_type {
            MOBILE_TERMINATED_EVENT => {
                info!("[{}] enqueue command", COMPONENT);
                let queued = match message.to_storage_json() {
                    Ok(json) => self.store.lpush(COMMAND_QUEUE_KEY, &json).await.map(drop),
                    Err(e) => Err(e),
                };
                if let Err(e) = queued {
                    error!("[{}] enqueue error: {}", COMPONENT, e);
                }
                InboundOutcome::Command
            }
            MOBILE_TERMINATED_ACK => {
                let sequence = message.sequence_number;
                if self.take_hint(sequence) {
                    info!(sequence, "[{}] ignore ack", COMPONENT);
                    return InboundOutcome::IgnoreAck(sequence);
                }

                info!(sequence, "[{}] relay ack", COMPONENT);
                if let Err(e) = self.store.lpush(ACK_QUEUE_KEY, &sequence.to_string()).await {
                    error!("[{}] enqueue error: {}", COMPONENT, e);
                }
                InboundOutcome::RelayAck(sequence)
            }
            other => {
                let e = GatewayError::UnexpectedMessageType { message_type: other };
                error!("[{}] {}", COMPONENT, e);
                InboundOutcome::UnexpectedType(other)
            }
        }
    }

    /// Clear the hint if it matches `sequence`.
    fn take_hint(&self, sequence: u16) -> bool {
        let mut hint = lock(&self.ack_hint);
        if *hint == Some(sequence) {
            *hint = None;
            true
        } else {
            false
        }
    }

    /// Forward `data` over `path` and record when it was sent.
    async fn relay(&self, path: Path, data: &[u8]) -> Result<()> {
        let Some(outside) = lock(&self.outside).clone() else {
            return Err(GatewayError::NotStarted { component: COMPONENT });
        };

        let (host, port) = self.config.destination(path);
        if let Err(e) = outside.send_to(data, (host, port)).await {
            Counters::bump(&self.counters.send_errors);
            error!(host, port, error = %e, "[outside] send error");
            return Err(GatewayError::io_error(format!("send to {host}:{port}"), e));
        }
        info!(size = data.len(), host, port, "[outside] outgoing");

        Counters::bump(match path {
            Path::Private => &self.counters.sent_private,
            Path::Public => &self.counters.sent_public,
        });
        self.record_transmit(path).await;
        self.publish(ProxyEvent::Send(path));
        Ok(())
    }

    async fn record_transmit(&self, path: Path) {
        let now = now_millis().to_string();
        let recorded = match path {
            Path::Private => {
                self.store
                    .mset(&[
                        (LAST_TIMESTAMP_KEY.to_string(), now.clone()),
                        (LAST_PRIVATE_TIMESTAMP_KEY.to_string(), now),
                    ])
                    .await
            }
            Path::Public => self.store.set(LAST_TIMESTAMP_KEY, &now).await,
        };
        if let Err(e) = recorded {
            warn!("[{}] transmit bookkeeping failed: {}", COMPONENT, e);
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

async fn bind(address: IpAddr, port: u16, name: &str) -> Result<UdpSocket> {
    UdpSocket::bind((address, port))
        .await
        .map_err(|e| GatewayError::io_error(format!("bind {name} socket to {address}:{port}"), e))
}

fn local_addr(socket: &UdpSocket, name: &str) -> Result<SocketAddr> {
    socket.local_addr().map_err(|e| GatewayError::io_error(format!("{name} socket address"), e))
}

/// Running relay. Dropping it closes every socket once the relay task
/// observes the cancellation; [`GatewayProxy::stop`] waits for that.
pub struct GatewayProxy {
    shared: Arc<ProxyShared>,
    addrs: ProxyAddrs,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl GatewayProxy {
    /// Bind the three sockets and start relaying.
    pub async fn start(
        config: GatewayConfig,
        store: Arc<dyn KeyValueStore>,
        settings: &ProxySettings,
    ) -> Result<Self> {
        info!("[{}] start watching", COMPONENT);

        let outside = Arc::new(bind(settings.bind_address, 0, "outside").await?);
        let private = bind(settings.bind_address, config.private_relay, "private").await?;
        let public = bind(settings.bind_address, config.public_relay, "public").await?;
        let addrs = ProxyAddrs {
            outside: local_addr(&outside, "outside")?,
            private: local_addr(&private, "private")?,
            public: local_addr(&public, "public")?,
        };
        debug!(?addrs, "[{}] bound", COMPONENT);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(ProxyShared {
            config,
            store,
            outside: Mutex::new(Some(Arc::clone(&outside))),
            ack_hint: Mutex::new(None),
            events,
            counters: Counters::default(),
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&shared), outside, private, public, cancel.clone()));

        Ok(Self { shared, addrs, cancel: Some(cancel), task: Some(task) })
    }

    /// Close all sockets. The relay ports are free again when this returns.
    /// Stopping an already stopped proxy does nothing.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(cancel) = self.cancel.take() else {
            debug!("[{}] already stopped", COMPONENT);
            return Ok(());
        };

        info!("[{}] stop watching", COMPONENT);
        lock(&self.shared.outside).take();
        cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("[{}] relay task failed: {}", COMPONENT, e);
            }
        }
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    pub fn local_addrs(&self) -> ProxyAddrs {
        self.addrs
    }

    pub fn events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> ProxyStats {
        self.shared.counters.snapshot()
    }

    /// Drop the next acknowledgement carrying `sequence_number` instead of
    /// queueing it. Only one hint is held; arming another replaces it.
    pub fn ignore_ack(&self, sequence_number: u16) {
        debug!(sequence_number, "[{}] ignore ack hint", COMPONENT);
        *lock(&self.shared.ack_hint) = Some(sequence_number);
    }

    /// Send `data` over the configured primary path.
    pub async fn send_primary(&self, data: &[u8], sequence_number: u16) -> Result<()> {
        let path = self.shared.config.primary;
        debug!(sequence_number, %path, "[{}] send primary", COMPONENT);
        self.shared.relay(path, data).await
    }
}

impl Drop for GatewayProxy {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

async fn run(
    shared: Arc<ProxyShared>,
    outside: Arc<UdpSocket>,
    private: UdpSocket,
    public: UdpSocket,
    cancel: CancellationToken,
) {
    let mut outside_buf = vec![0u8; MAX_DATAGRAM];
    let mut private_buf = vec![0u8; MAX_DATAGRAM];
    let mut public_buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = outside.recv_from(&mut outside_buf) => match received {
                Ok((n, from)) => shared.receive_outside(&outside_buf[..n], from).await,
                Err(e) => warn!("[outside] receive error: {}", e),
            },
            received = private.recv_from(&mut private_buf) => match received {
                Ok((n, from)) => {
                    info!(size = n, %from, "[private] incoming");
                    let _ = shared.relay(Path::Private, &private_buf[..n]).await;
                }
                Err(e) => warn!("[private] receive error: {}", e),
            },
            received = public.recv_from(&mut public_buf) => match received {
                Ok((n, from)) => {
                    info!(size = n, %from, "[public] incoming");
                    let _ = shared.relay(Path::Public, &public_buf[..n]).await;
                }
                Err(e) => warn!("[public] receive error: {}", e),
            },
        }
    }

    drop(private);
    info!("[private] connection closed");
    drop(public);
    info!("[public] connection closed");
    drop(outside);
    info!("[outside] connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreCall};
    use crate::wire::{MOBILE_ORIGINATED_EVENT, crc8};
    use std::time::Duration;

    const IMEI: &str = "123456789012345";

    struct Harness {
        proxy: GatewayProxy,
        store: Arc<MemoryStore>,
        events: broadcast::Receiver<ProxyEvent>,
        private_host: UdpSocket,
        public_host: UdpSocket,
        device: UdpSocket,
    }

    impl Harness {
        async fn start(primary: Path) -> Self {
            let private_host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let public_host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let config = GatewayConfig {
                primary,
                private_host: "127.0.0.1".into(),
                private_port: private_host.local_addr().unwrap().port(),
                private_relay: 0,
                public_host: "127.0.0.1".into(),
                public_port: public_host.local_addr().unwrap().port(),
                public_relay: 0,
                imei: Some(IMEI.into()),
            };
            let store = Arc::new(MemoryStore::new());
            let settings = ProxySettings { bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST) };
            let proxy = GatewayProxy::start(config, store.clone(), &settings).await.unwrap();
            let events = proxy.events();
            let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            Self { proxy, store, events, private_host, public_host, device }
        }

        async fn to_outside(&self, data: &[u8]) {
            self.device.send_to(data, self.proxy.local_addrs().outside).await.unwrap();
        }

        async fn next_event(&mut self) -> ProxyEvent {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("proxy event")
                .unwrap()
        }
    }

    async fn receive(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; 1024];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .expect("relayed datagram")
            .unwrap();
        buf.truncate(n);
        (buf, from)
    }

    fn ack(sequence: u16) -> Vec<u8> {
        WireMessage::new(MOBILE_TERMINATED_ACK)
            .with_sequence_number(sequence)
            .push_string(0, IMEI)
            .to_wire()
            .unwrap()
    }

    #[test]
    fn config_reads_checkpoint_output() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "imei": IMEI,
            "privateHost": "private-host",
            "privatePort": 3011,
            "publicHost": "public-host",
            "publicPort": 3011
        }))
        .unwrap();
        assert_eq!(config.primary, Path::Public);
        assert_eq!(config.relay_port(Path::Private), 4000);
        assert_eq!(config.relay_port(Path::Public), 4001);
        assert_eq!(config.destination(Path::Private), ("private-host", 3011));
    }

    #[tokio::test]
    async fn start_binds_relays_and_stop_closes() {
        let mut h = Harness::start(Path::Public).await;
        let addrs = h.proxy.local_addrs();
        assert_ne!(addrs.private.port(), 0);
        assert_ne!(addrs.public.port(), 0);
        assert!(h.proxy.started());

        h.proxy.stop().await.unwrap();
        assert!(!h.proxy.started());
        h.proxy.stop().await.unwrap();
        assert!(matches!(
            h.proxy.send_primary(b"test", 1).await,
            Err(GatewayError::NotStarted { .. })
        ));
        assert!(h.store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn restarts_on_the_same_relay_ports() {
        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let free_port = || {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let config = GatewayConfig {
            primary: Path::Private,
            private_host: "127.0.0.1".into(),
            private_port: host.local_addr().unwrap().port(),
            private_relay: free_port(),
            public_host: "127.0.0.1".into(),
            public_port: host.local_addr().unwrap().port(),
            public_relay: free_port(),
            imei: None,
        };
        let store = Arc::new(MemoryStore::new());
        let settings = ProxySettings { bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST) };

        let mut first =
            GatewayProxy::start(config.clone(), store.clone(), &settings).await.unwrap();
        first.stop().await.unwrap();

        let mut second = GatewayProxy::start(config.clone(), store, &settings).await.unwrap();
        let addrs = second.local_addrs();
        assert_eq!(addrs.private.port(), config.private_relay);
        assert_eq!(addrs.public.port(), config.public_relay);

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        device.send_to(b"again", addrs.private).await.unwrap();
        assert_eq!(receive(&host).await.0, b"again");
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_crc_is_dropped() {
        let mut h = Harness::start(Path::Public).await;
        h.to_outside(b"test").await;

        assert_eq!(h.next_event().await, ProxyEvent::Inbound(InboundOutcome::CrcError));
        assert!(h.store.snapshot().is_empty());
        assert_eq!(h.proxy.stats().crc_errors, 1);
        assert_eq!(h.proxy.stats().received, 1);
    }

    #[tokio::test]
    async fn corrupted_bytes_never_reach_the_store() {
        let mut h = Harness::start(Path::Public).await;
        let valid =
            WireMessage::new(MOBILE_TERMINATED_EVENT).push_string(0, IMEI).to_wire().unwrap();

        for at in 0..valid.len() - 1 {
            let mut corrupted = valid.clone();
            corrupted[at] ^= 0x01;
            h.to_outside(&corrupted).await;
            assert_eq!(h.next_event().await, ProxyEvent::Inbound(InboundOutcome::CrcError));
        }
        assert!(h.store.snapshot().is_empty());
        assert_eq!(h.proxy.stats().crc_errors, valid.len() as u64 - 1);
    }

    #[tokio::test]
    async fn unexpected_message_type_is_dropped() {
        let mut h = Harness::start(Path::Public).await;
        let wire = WireMessage::new(255).push_string(0, IMEI).to_wire().unwrap();
        assert_eq!(wire.len(), 34);
        h.to_outside(&wire).await;
        assert_eq!(h.next_event().await, ProxyEvent::Inbound(InboundOutcome::UnexpectedType(255)));

        h.to_outside(&WireMessage::new(MOBILE_ORIGINATED_EVENT).to_wire().unwrap()).await;
        assert_eq!(
            h.next_event().await,
            ProxyEvent::Inbound(InboundOutcome::UnexpectedType(MOBILE_ORIGINATED_EVENT))
        );
        assert!(h.store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn truncated_message_is_a_decode_error() {
        let mut h = Harness::start(Path::Public).await;
        let mut short = vec![1, 0, MOBILE_TERMINATED_EVENT];
        short.push(crc8(&short));
        h.to_outside(&short).await;
        assert_eq!(h.next_event().await, ProxyEvent::Inbound(InboundOutcome::DecodeError));
        assert!(h.store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn mt_event_is_queued_as_a_command() {
        let mut h = Harness::start(Path::Public).await;
        let wire =
            WireMessage::new(MOBILE_TERMINATED_EVENT).push_string(0, IMEI).to_wire().unwrap();
        h.to_outside(&wire).await;

        assert_eq!(h.next_event().await, ProxyEvent::Inbound(InboundOutcome::Command));
        assert_eq!(
            h.store.snapshot(),
            vec![StoreCall::Lpush(
                COMMAND_QUEUE_KEY.into(),
                r#"{"majorVersion":1,"minorVersion":0,"messageType":204,"eventCode":0,"sequenceNumber":0,"timestamp":0,"tuples":[{"type":2,"id":0,"value":"123456789012345"}]}"#.into()
            )]
        );
    }

    #[tokio::test]
    async fn mt_ack_is_relayed_without_a_hint() {
        let mut h = Harness::start(Path::Public).await;
        h.to_outside(&ack(10)).await;

        assert_eq!(h.next_event().await, ProxyEvent::Inbound(InboundOutcome::RelayAck(10)));
        assert_eq!(h.store.snapshot(), vec![StoreCall::Lpush(ACK_QUEUE_KEY.into(), "10".into())]);
    }

    #[tokio::test]
    async fn hinted_ack_is_ignored_exactly_once() {
        let mut h = Harness::start(Path::Public).await;
        h.proxy.ignore_ack(10);

        h.to_outside(&ack(10)).await;
        assert_eq!(h.next_event().await, ProxyEvent::Inbound(InboundOutcome::IgnoreAck(10)));
        assert!(h.store.snapshot().is_empty());

        h.to_outside(&ack(10)).await;
        assert_eq!(h.next_event().await, ProxyEvent::Inbound(InboundOutcome::RelayAck(10)));
        assert_eq!(h.store.snapshot(), vec![StoreCall::Lpush(ACK_QUEUE_KEY.into(), "10".into())]);
        assert_eq!(h.proxy.stats().ignored_acks, 1);
        assert_eq!(h.proxy.stats().relayed_acks, 1);
    }

    #[tokio::test]
    async fn last_armed_hint_wins() {
        let mut h = Harness::start(Path::Public).await;
        h.proxy.ignore_ack(1);
        h.proxy.ignore_ack(2);

        h.to_outside(&ack(1)).await;
        assert_eq!(h.next_event().await, ProxyEvent::Inbound(InboundOutcome::RelayAck(1)));
        h.to_outside(&ack(2)).await;
        assert_eq!(h.next_event().await, ProxyEvent::Inbound(InboundOutcome::IgnoreAck(2)));
        assert_eq!(h.store.snapshot(), vec![StoreCall::Lpush(ACK_QUEUE_KEY.into(), "1".into())]);
    }

    #[tokio::test]
    async fn private_relay_updates_both_timestamps() {
        let mut h = Harness::start(Path::Public).await;
        h.device.send_to(b"test", h.proxy.local_addrs().private).await.unwrap();

        let (data, from) = receive(&h.private_host).await;
        assert_eq!(data, b"test");
        assert_eq!(from.port(), h.proxy.local_addrs().outside.port());
        assert_eq!(h.next_event().await, ProxyEvent::Send(Path::Private));

        match h.store.snapshot().as_slice() {
            [StoreCall::Mset(pairs)] => {
                assert_eq!(pairs.len(), 2);
                assert_eq!(pairs[0].0, LAST_TIMESTAMP_KEY);
                assert_eq!(pairs[1].0, LAST_PRIVATE_TIMESTAMP_KEY);
                assert_eq!(pairs[0].1, pairs[1].1);
            }
            other => panic!("expected one mset, got {other:?}"),
        }
        assert_eq!(h.proxy.stats().sent_private, 1);
    }

    #[tokio::test]
    async fn public_relay_updates_only_the_shared_timestamp() {
        let mut h = Harness::start(Path::Private).await;
        h.device.send_to(b"test", h.proxy.local_addrs().public).await.unwrap();

        let (data, _) = receive(&h.public_host).await;
        assert_eq!(data, b"test");
        assert_eq!(h.next_event().await, ProxyEvent::Send(Path::Public));

        match h.store.snapshot().as_slice() {
            [StoreCall::Set(key, value)] => {
                assert_eq!(key, LAST_TIMESTAMP_KEY);
                assert!(value.parse::<u64>().unwrap() > 1_000_000_000_000);
            }
            other => panic!("expected one set, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_primary_follows_the_configured_path() {
        let mut public = Harness::start(Path::Public).await;
        public.proxy.send_primary(b"test", 1).await.unwrap();
        assert_eq!(receive(&public.public_host).await.0, b"test");
        assert_eq!(public.next_event().await, ProxyEvent::Send(Path::Public));
        assert!(matches!(public.store.snapshot().as_slice(), [StoreCall::Set(..)]));

        let mut private = Harness::start(Path::Private).await;
        private.proxy.send_primary(b"test", 2).await.unwrap();
        assert_eq!(receive(&private.private_host).await.0, b"test");
        assert_eq!(private.next_event().await, ProxyEvent::Send(Path::Private));
        assert!(matches!(private.store.snapshot().as_slice(), [StoreCall::Mset(..)]));
    }

    #[tokio::test]
    async fn bookkeeping_failures_do_not_stop_relaying() {
        let mut h = Harness::start(Path::Public).await;
        h.store.fail_with(Some("connection refused"));

        h.proxy.send_primary(b"first", 1).await.unwrap();
        assert_eq!(h.next_event().await, ProxyEvent::Send(Path::Public));
        h.proxy.send_primary(b"second", 2).await.unwrap();
        assert_eq!(receive(&h.public_host).await.0, b"first");
        assert_eq!(receive(&h.public_host).await.0, b"second");
        assert_eq!(h.proxy.stats().sent_public, 2);
    }
}
