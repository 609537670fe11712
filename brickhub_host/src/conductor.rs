//! Multi-device orchestration. The conductor owns one state record per
//! device, connects them concurrently (EV3 first, since its transport
//! fallback is the slow path), routes platform-agnostic action names
//! through the command registry and coordinates cross-device runs with
//! the collaboration patterns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use brickhub_common::device::{Action, DeviceConfig, Platform};
use brickhub_common::error::HubError;
use brickhub_common::registry::CommandRegistry;
use futures::future::{join_all, BoxFuture};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collab::Pattern;
use crate::ev3::{Ev3Link, LineReply};
use crate::spike::executor::FastExecutor;
use crate::spike::session::{BleGattLink, SlotSession};

/// Platform session held for a connected device.
pub enum DeviceSession {
    Ev3(Ev3Link),
    Spike(FastExecutor),
}

/// Runtime state of one registered device.
pub struct DeviceState {
    pub config: DeviceConfig,
    pub connected: bool,
    pub session: Option<DeviceSession>,
    pub latency_ms: f64,
    pub commands_sent: u64,
}

impl DeviceState {
    fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            connected: false,
            session: None,
            latency_ms: 0.0,
            commands_sent: 0,
        }
    }
}

/// Seam between the conductor and the platform connection machinery, so
/// orchestration logic is testable against in-memory sessions.
pub trait DeviceConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        config: &'a DeviceConfig,
    ) -> BoxFuture<'a, Result<DeviceSession, HubError>>;
}

/// Real hardware connector. EV3 links are built without a daemon
/// bootstrap; callers that want the SSH fallback supply their own
/// connector wiring a [`crate::bootstrap::DaemonBootstrap`] in.
pub struct DefaultConnector;

impl DeviceConnector for DefaultConnector {
    fn connect<'a>(
        &'a self,
        config: &'a DeviceConfig,
    ) -> BoxFuture<'a, Result<DeviceSession, HubError>> {
        Box::pin(async move {
            match config.platform {
                Platform::Ev3 => {
                    let mut link = Ev3Link::new(config.clone());
                    link.connect().await?;
                    Ok(DeviceSession::Ev3(link))
                }
                Platform::SpikePrime => {
                    let link = BleGattLink::connect(config).await?;
                    let session = SlotSession::connect(Box::new(link)).await?;
                    // No preload at connect: uploading programs makes the
                    // hub play its melody, which callers may not want yet.
                    Ok(DeviceSession::Spike(FastExecutor::new(session)))
                }
            }
        })
    }
}

/// Whether sends wait for acknowledgement or fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyMode {
    #[default]
    Fire,
    Ack,
}

pub struct Conductor {
    devices: HashMap<String, Arc<tokio::sync::Mutex<DeviceState>>>,
    registry: Arc<CommandRegistry>,
    connector: Arc<dyn DeviceConnector>,
    latency_mode: LatencyMode,
    cancel: CancellationToken,
}

impl Conductor {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self {
            devices: HashMap::new(),
            registry,
            connector: Arc::new(DefaultConnector),
            latency_mode: LatencyMode::Fire,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn DeviceConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_latency_mode(mut self, mode: LatencyMode) -> Self {
        self.latency_mode = mode;
        self
    }

    pub fn add_device(&mut self, config: DeviceConfig) {
        info!(device = %config.name, platform = ?config.platform, "registered");
        self.devices.insert(
            config.name.clone(),
            Arc::new(tokio::sync::Mutex::new(DeviceState::new(config))),
        );
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel all further work when the process receives an interrupt.
    /// Callers still run `disconnect_all` themselves afterwards.
    pub fn cancel_on_ctrl_c(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    pub async fn is_connected(&self, device: &str) -> bool {
        match self.devices.get(device) {
            Some(state) => state.lock().await.connected,
            None => false,
        }
    }

    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for state in self.devices.values() {
            if state.lock().await.connected {
                count += 1;
            }
        }
        count
    }

    /// Last measured latency and total commands sent for a device.
    pub async fn stats(&self, device: &str) -> Option<(f64, u64)> {
        let state = self.devices.get(device)?.lock().await;
        Some((state.latency_ms, state.commands_sent))
    }

    /// Connect every registered device concurrently, EV3 futures created
    /// first. Returns `true` only when all devices connected; partial
    /// success is kept in the per-device state.
    pub async fn connect_all(&self) -> bool {
        let mut ordered: Vec<String> = Vec::new();
        let mut others: Vec<String> = Vec::new();
        for (name, state) in &self.devices {
            match state.lock().await.config.platform {
                Platform::Ev3 => ordered.push(name.clone()),
                _ => others.push(name.clone()),
            }
        }
        ordered.extend(others);

        let results = join_all(ordered.iter().map(|name| self.connect_device(name))).await;
        let connected = results.into_iter().filter(|ok| *ok).count();
        info!(connected, total = self.devices.len(), "connect pass complete");
        connected == self.devices.len()
    }

    async fn connect_device(&self, name: &str) -> bool {
        if self.cancel.is_cancelled() {
            debug!(device = name, "cancelled, skipping connect");
            return false;
        }
        let Some(state) = self.devices.get(name) else {
            return false;
        };
        let config = state.lock().await.config.clone();
        match self.connector.connect(&config).await {
            Ok(session) => {
                let mut state = state.lock().await;
                state.session = Some(session);
                state.connected = true;
                info!(device = name, "connected");
                true
            }
            Err(e) => {
                warn!(device = name, error = %e, "connect failed");
                false
            }
        }
    }

    /// Resolve the first token of an action through the registry, keeping
    /// any argument tail as-is.
    fn route(&self, platform: Platform, action: &str) -> String {
        let (name, rest) = match action.split_once(' ') {
            Some((name, rest)) => (name, Some(rest)),
            None => (action, None),
        };
        let resolved = match platform {
            Platform::Ev3 => self.registry.resolve_ev3(name),
            Platform::SpikePrime => self.registry.resolve_spike(name),
        };
        match rest {
            Some(rest) => format!("{resolved} {rest}"),
            None => resolved.to_string(),
        }
    }

    /// Send one action to one device. Errors are logged, never thrown:
    /// the return value is `(success, latency_ms)` with `(false, 0.0)`
    /// for any failure. A remote-initiated quit marks the device
    /// disconnected.
    pub async fn send(&self, device: &str, action: &str) -> (bool, f64) {
        if self.cancel.is_cancelled() {
            return (false, 0.0);
        }
        let Some(state) = self.devices.get(device) else {
            warn!(device, "unknown device");
            return (false, 0.0);
        };
        let mut state = state.lock().await;
        if !state.connected {
            return (false, 0.0);
        }
        let command = self.route(state.config.platform, action);
        let started = Instant::now();

        let mut ok = false;
        let mut lost = false;
        match state.session.as_mut() {
            None => {}
            Some(DeviceSession::Ev3(link)) => match self.latency_mode {
                LatencyMode::Fire => match link.send_fire(&command).await {
                    Ok(_) => ok = true,
                    Err(e) => {
                        warn!(device, command = %command, error = %e, "send failed");
                        lost = e.is_terminal();
                    }
                },
                LatencyMode::Ack => match link.send(&command).await {
                    Ok((LineReply::Ok(_), _)) => ok = true,
                    Ok((LineReply::Err(msg), _)) => {
                        warn!(device, command = %command, reply = %msg, "daemon rejected command");
                    }
                    Err(e) => {
                        warn!(device, command = %command, error = %e, "send failed");
                        lost = e.is_terminal();
                    }
                },
            },
            Some(DeviceSession::Spike(executor)) => {
                let wait = self.latency_mode == LatencyMode::Ack;
                match executor.fast_action(&command, wait).await {
                    Ok(_) => ok = true,
                    Err(e) => warn!(device, command = %command, error = %e, "send failed"),
                }
            }
        }
        if lost {
            state.connected = false;
        }
        if !ok {
            return (false, 0.0);
        }
        let latency = started.elapsed().as_secs_f64() * 1000.0;
        state.latency_ms = latency;
        state.commands_sent += 1;
        (true, latency)
    }

    /// Dispatch to several devices at once; per-device results keyed by
    /// device name.
    pub async fn parallel(&self, commands: &[(&str, &str)]) -> HashMap<String, (bool, f64)> {
        let sends = commands.iter().map(|(device, action)| async move {
            ((*device).to_string(), self.send(device, action).await)
        });
        join_all(sends).await.into_iter().collect()
    }

    /// Sleep unless the cancellation token fires first. Returns `true`
    /// on cancellation so batch loops can stop issuing work.
    async fn sleep_or_cancelled(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Dispatch one at a time with a fixed delay between commands. A
    /// cancellation ends the batch at the next step boundary instead of
    /// running out the remaining delays.
    pub async fn sequence(&self, commands: &[(&str, &str)], delay_ms: u64) {
        for (device, action) in commands {
            if self.cancel.is_cancelled() {
                debug!("cancelled, abandoning sequence");
                break;
            }
            let (ok, latency) = self.send(device, action).await;
            debug!(device, action, ok, latency_ms = latency, "sequence step");
            if self.sleep_or_cancelled(Duration::from_millis(delay_ms)).await {
                break;
            }
        }
    }

    /// Pre-upload the builtin actions on a connected Spike device.
    /// Returns how many actions are ready; zero for anything else.
    pub async fn preload(&self, device: &str) -> usize {
        let Some(state) = self.devices.get(device) else {
            return 0;
        };
        let mut state = state.lock().await;
        match state.session.as_mut() {
            Some(DeviceSession::Spike(executor)) => executor.preload().await,
            _ => 0,
        }
    }

    /// Run a set of actions under a collaboration pattern. Returns the
    /// total elapsed wall-clock time in milliseconds.
    pub async fn collaborate(&self, pattern: &Pattern, actions: &[Action]) -> f64 {
        let started = Instant::now();
        match pattern {
            Pattern::Parallel => {
                let sends = actions.iter().map(|action| {
                    let command = full_command(action);
                    async move {
                        self.send(&action.device, &command).await;
                    }
                });
                join_all(sends).await;
            }
            Pattern::Choreographed { gap_ms } => {
                // Per-device lanes in first-appearance order, lane k
                // staggered by k * gap/2.
                let mut lanes: Vec<(String, Vec<String>)> = Vec::new();
                for action in actions {
                    let command = full_command(action);
                    match lanes.iter_mut().find(|(device, _)| device == &action.device) {
                        Some((_, commands)) => commands.push(command),
                        None => lanes.push((action.device.clone(), vec![command])),
                    }
                }
                let gap = Duration::from_millis(*gap_ms);
                let tasks = lanes
                    .into_iter()
                    .enumerate()
                    .map(|(k, (device, commands))| async move {
                        if self.sleep_or_cancelled(gap / 2 * k as u32).await {
                            return;
                        }
                        for command in commands {
                            self.send(&device, &command).await;
                            if self.sleep_or_cancelled(gap).await {
                                return;
                            }
                        }
                    });
                join_all(tasks).await;
            }
            Pattern::SignalBased { queue, timeout } => {
                queue.clear().await;
                for (step, action) in actions.iter().enumerate() {
                    if self.cancel.is_cancelled() {
                        debug!(step, "cancelled, abandoning run");
                        break;
                    }
                    self.send(&action.device, &full_command(action)).await;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            debug!(step, "cancelled while awaiting signal");
                            break;
                        }
                        signal = queue.wait(*timeout) => match signal {
                            Some(signal) => debug!(
                                source = %signal.source,
                                index = signal.action_index,
                                "step signalled"
                            ),
                            None => warn!(step, "no signal before timeout, continuing"),
                        },
                    }
                }
            }
        }
        started.elapsed().as_secs_f64() * 1000.0
    }

    /// Best-effort teardown of every device; failures are logged.
    pub async fn disconnect_all(&self) {
        for (name, state) in &self.devices {
            let mut state = state.lock().await;
            if let Some(session) = state.session.take() {
                match session {
                    DeviceSession::Ev3(mut link) => link.disconnect().await,
                    DeviceSession::Spike(executor) => executor.shutdown().await,
                }
                debug!(device = %name, "disconnected");
            }
            state.connected = false;
        }
        info!("all devices disconnected");
    }
}

fn full_command(action: &Action) -> String {
    if action.args.is_empty() {
        action.action.clone()
    } else {
        format!("{} {}", action.action, action.args.join(" "))
    }
}
