//! EV3 line protocol: a newline-terminated request/response session on
//! top of any [`Transport`], plus the link that picks a transport
//! (USB, then WiFi, then Bluetooth), waits for the daemon's `READY`
//! greeting and falls back to an SSH daemon bootstrap when nothing is
//! reachable.

use std::time::{Duration, Instant};

use brickhub_common::device::{DeviceConfig, TransportPreference};
use brickhub_common::error::HubError;
use tracing::{debug, info, warn};

use crate::bootstrap::DaemonBootstrap;
use crate::transport::{DefaultTransportFactory, Transport, TransportFactory, TransportKind};

/// Absence of `READY` within this window means "wrong or absent daemon";
/// the next transport is tried.
const READY_TIMEOUT: Duration = Duration::from_secs(3);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Linear backoff between reconnect attempts after a daemon bootstrap.
const BOOTSTRAP_BACKOFF_SECS: [u64; 5] = [2, 4, 6, 8, 10];

/// One daemon reply, parsed once at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineReply {
    Ok(String),
    Err(String),
}

impl LineReply {
    fn parse(line: &str) -> Self {
        if let Some(rest) = line.strip_prefix("ERR:") {
            LineReply::Err(rest.trim().to_string())
        } else if line.starts_with("ERR") {
            LineReply::Err(line.trim().to_string())
        } else {
            LineReply::Ok(line.trim().to_string())
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, LineReply::Ok(_))
    }
}

/// Request/response session over a connected transport. The daemon
/// answers each command with exactly one line; `QUIT:<reason>` is a
/// daemon-initiated disconnect (e.g. a physical button press) and
/// poisons the session permanently.
pub struct HandshakeSession {
    transport: Box<dyn Transport>,
    reply_timeout: Duration,
    alive: bool,
}

impl HandshakeSession {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            reply_timeout: REPLY_TIMEOUT,
            alive: true,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn transport_name(&self) -> String {
        self.transport.name()
    }

    /// Send a command and await its one-line reply. Returns the parsed
    /// reply and the measured round-trip latency in milliseconds.
    pub async fn send(&mut self, command: &str) -> Result<(LineReply, f64), HubError> {
        if !self.alive {
            return Err(HubError::NotConnected);
        }
        let start = Instant::now();
        let mut data = command.as_bytes().to_vec();
        data.push(b'\n');
        self.transport.send(&data).await?;
        let line = self.transport.receive_line(self.reply_timeout).await?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        if let Some(reason) = line.strip_prefix("QUIT:").or(if line == "QUIT" { Some("") } else { None }) {
            self.alive = false;
            return Err(HubError::RemoteQuit(reason.trim().to_string()));
        }
        Ok((LineReply::parse(&line), latency_ms))
    }

    /// Fire-and-forget: write the command, skip the reply. Returns the
    /// write latency in milliseconds.
    pub async fn send_fire(&mut self, command: &str) -> Result<f64, HubError> {
        if !self.alive {
            return Err(HubError::NotConnected);
        }
        let start = Instant::now();
        let mut data = command.as_bytes().to_vec();
        data.push(b'\n');
        self.transport.send(&data).await?;
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }

    /// Submit several commands as one `|`-delimited batch. The daemon
    /// answers a batch with a single line (semicolon-joined errors or a
    /// synthesized success), parsed like any other reply.
    pub async fn send_batch(&mut self, commands: &[&str]) -> Result<(LineReply, f64), HubError> {
        let batch = format!("|{}", commands.join("|"));
        self.send(&batch).await
    }

    /// Best-effort shutdown: tell the daemon to quit, then drop the
    /// transport. Errors are ignored.
    pub async fn close(mut self) {
        if self.alive {
            let _ = self.send_fire("quit").await;
        }
        self.transport.disconnect().await;
    }
}

/// Transport auto-selection, READY handshake and daemon bootstrap for
/// one EV3 device.
pub struct Ev3Link {
    config: DeviceConfig,
    factory: Box<dyn TransportFactory>,
    bootstrap: Option<Box<dyn DaemonBootstrap>>,
    session: Option<HandshakeSession>,
}

impl Ev3Link {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            factory: Box::new(DefaultTransportFactory),
            bootstrap: None,
            session: None,
        }
    }

    pub fn with_factory(mut self, factory: Box<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: Box<dyn DaemonBootstrap>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(HandshakeSession::is_alive)
    }

    pub fn transport_name(&self) -> Option<String> {
        self.session.as_ref().map(HandshakeSession::transport_name)
    }

    /// Connect using the best available transport. If none is reachable
    /// and a bootstrap is configured, start the daemon over the side
    /// channel and retry with linear backoff. Every failed attempt tears
    /// its transport down; no partial state is left open.
    pub async fn connect(&mut self) -> Result<(), HubError> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(session) = self.try_transports().await {
            self.session = Some(session);
            return Ok(());
        }

        if let Some(bootstrap) = &self.bootstrap {
            info!(device = %self.config.name, "no transport reachable, bootstrapping daemon");
            bootstrap
                .kill_stale_daemon()
                .await
                .map_err(|e| HubError::BootstrapFailed(e.to_string()))?;
            bootstrap
                .start_daemon_detached()
                .await
                .map_err(|e| HubError::BootstrapFailed(e.to_string()))?;

            for (attempt, backoff) in BOOTSTRAP_BACKOFF_SECS.into_iter().enumerate() {
                debug!(
                    device = %self.config.name,
                    attempt = attempt + 1,
                    backoff_secs = backoff,
                    "waiting for daemon"
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                if let Some(session) = self.try_transports().await {
                    self.session = Some(session);
                    return Ok(());
                }
            }
        }
        Err(HubError::ConnectionFailed)
    }

    /// One pass over the transports in priority order. Transport-level
    /// failures are logged and drive fallback, not surfaced.
    async fn try_transports(&mut self) -> Option<HandshakeSession> {
        let order: &[TransportKind] = match self.config.transport {
            TransportPreference::Auto => &[
                TransportKind::Usb,
                TransportKind::Wifi,
                TransportKind::Bluetooth,
            ],
            TransportPreference::Usb => &[TransportKind::Usb],
            TransportPreference::Wifi => &[TransportKind::Wifi],
            TransportPreference::Bluetooth => &[TransportKind::Bluetooth],
        };

        for &kind in order {
            let Some(mut transport) = self.factory.create(kind, &self.config) else {
                continue;
            };
            if let Err(e) = transport.connect().await {
                debug!(device = %self.config.name, ?kind, error = %e, "transport connect failed");
                continue;
            }
            match transport.receive_line(READY_TIMEOUT).await {
                Ok(line) if line.contains("READY") => {
                    info!(device = %self.config.name, transport = %transport.name(), "daemon ready");
                    return Some(HandshakeSession::new(transport));
                }
                Ok(line) => {
                    warn!(
                        device = %self.config.name,
                        transport = %transport.name(),
                        greeting = %line,
                        "unexpected greeting, trying next transport"
                    );
                    transport.disconnect().await;
                }
                Err(_) => {
                    warn!(
                        device = %self.config.name,
                        transport = %transport.name(),
                        "no READY signal, trying next transport"
                    );
                    transport.disconnect().await;
                }
            }
        }
        None
    }

    pub async fn send(&mut self, command: &str) -> Result<(LineReply, f64), HubError> {
        let session = self.session.as_mut().ok_or(HubError::NotConnected)?;
        match session.send(command).await {
            Err(e) if e.is_terminal() => {
                // Daemon said quit: drop the dead session, never retry it.
                warn!(device = %self.config.name, error = %e, "remote quit");
                self.session = None;
                Err(e)
            }
            other => other,
        }
    }

    pub async fn send_fire(&mut self, command: &str) -> Result<f64, HubError> {
        self.session
            .as_mut()
            .ok_or(HubError::NotConnected)?
            .send_fire(command)
            .await
    }

    pub async fn send_batch(&mut self, commands: &[&str]) -> Result<(LineReply, f64), HubError> {
        let session = self.session.as_mut().ok_or(HubError::NotConnected)?;
        match session.send_batch(commands).await {
            Err(e) if e.is_terminal() => {
                self.session = None;
                Err(e)
            }
            other => other,
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub(crate) type Shared<T> = Arc<parking_lot::Mutex<T>>;

    pub(crate) struct FakeTransport {
        pub(crate) label: &'static str,
        pub(crate) ready: Arc<AtomicBool>,
        pub(crate) replies: Shared<VecDeque<String>>,
        pub(crate) written: Shared<Vec<String>>,
        pub(crate) connected: bool,
        pub(crate) greeted: bool,
    }

    impl Transport for FakeTransport {
        fn name(&self) -> String {
            self.label.to_string()
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn connect(&mut self) -> BoxFuture<'_, Result<(), HubError>> {
            Box::pin(async move {
                self.connected = true;
                Ok(())
            })
        }

        fn disconnect(&mut self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.connected = false;
            })
        }

        fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), HubError>> {
            Box::pin(async move {
                self.written
                    .lock()
                    .push(String::from_utf8_lossy(data).into_owned());
                Ok(())
            })
        }

        fn receive_line(&mut self, _timeout: Duration) -> BoxFuture<'_, Result<String, HubError>> {
            Box::pin(async move {
                if !self.greeted {
                    if self.ready.load(Ordering::SeqCst) {
                        self.greeted = true;
                        return Ok("READY".to_string());
                    }
                    return Err(HubError::Timeout);
                }
                self.replies.lock().pop_front().ok_or(HubError::Timeout)
            })
        }
    }

    #[derive(Clone)]
    pub(crate) struct Endpoint {
        pub(crate) ready: Arc<AtomicBool>,
        pub(crate) replies: Shared<VecDeque<String>>,
    }

    impl Endpoint {
        pub(crate) fn ready_with(replies: &[&str]) -> Self {
            Self {
                ready: Arc::new(AtomicBool::new(true)),
                replies: Arc::new(parking_lot::Mutex::new(
                    replies.iter().map(|s| s.to_string()).collect(),
                )),
            }
        }

        pub(crate) fn silent() -> Self {
            Self {
                ready: Arc::new(AtomicBool::new(false)),
                replies: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
            }
        }
    }

    pub(crate) struct TestFactory {
        pub(crate) usb: Option<Endpoint>,
        pub(crate) wifi: Option<Endpoint>,
        pub(crate) bt: Option<Endpoint>,
        pub(crate) written: Shared<Vec<String>>,
    }

    impl TestFactory {
        pub(crate) fn new() -> Self {
            Self {
                usb: None,
                wifi: None,
                bt: None,
                written: Arc::new(parking_lot::Mutex::new(Vec::new())),
            }
        }
    }

    impl TransportFactory for TestFactory {
        fn create(&self, kind: TransportKind, _config: &DeviceConfig) -> Option<Box<dyn Transport>> {
            let (label, endpoint) = match kind {
                TransportKind::Usb => ("usb:fake", self.usb.as_ref()?),
                TransportKind::Wifi => ("wifi:fake", self.wifi.as_ref()?),
                TransportKind::Bluetooth => ("bt:fake", self.bt.as_ref()?),
            };
            Some(Box::new(FakeTransport {
                label,
                ready: endpoint.ready.clone(),
                replies: endpoint.replies.clone(),
                written: self.written.clone(),
                connected: false,
                greeted: false,
            }))
        }
    }

    pub(crate) struct RecordingBootstrap {
        pub(crate) calls: Shared<Vec<&'static str>>,
        pub(crate) ready_on_start: Option<Arc<AtomicBool>>,
    }

    impl DaemonBootstrap for RecordingBootstrap {
        fn kill_stale_daemon(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.calls.lock().push("kill");
                Ok(())
            })
        }

        fn start_daemon_detached(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.calls.lock().push("start");
                if let Some(flag) = &self.ready_on_start {
                    flag.store(true, Ordering::SeqCst);
                }
                Ok(())
            })
        }
    }
}
