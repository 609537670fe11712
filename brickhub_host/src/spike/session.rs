//! Slot protocol session over a BLE GATT characteristic pair.
//!
//! The hub exposes one service with a write characteristic (host to hub)
//! and a notify characteristic (hub to host). A spawned task reassembles
//! notification packets into frames and dispatches them: responses
//! resolve the single pending correlated request, console notifications
//! go to the registered callback. Only one correlated request may be
//! outstanding; a second caller gets [`HubError::Busy`].

use std::sync::Arc;
use std::time::Duration;

use brickhub_common::device::DeviceConfig;
use brickhub_common::error::{HubError, ProtocolStage};
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, ValueNotification, WriteType};
use btleplug::platform::{Manager, Peripheral};
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::cobs;
use super::crc;
use super::messages::{self, InfoResponse, Message};

pub const SPIKE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fd02_0000_1000_8000_00805f9b34fb);
pub const SPIKE_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fd02_0001_1000_8000_00805f9b34fb);
pub const SPIKE_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fd02_0002_1000_8000_00805f9b34fb);

const SCAN_WINDOW: Duration = Duration::from_secs(3);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Object-safe BLE link: raw characteristic writes out, raw notification
/// packets in. Protocol logic above this seam runs against in-memory
/// links in tests.
pub trait GattLink: Send {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), HubError>>;

    /// Subscribe to the notify characteristic. Packets arrive on the
    /// returned channel until the link closes.
    fn subscribe(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<u8>>, HubError>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingDeviceInfo,
    Connected,
    Disconnecting,
}

type ConsoleCallback = Box<dyn Fn(&str) + Send + Sync>;

struct Pending {
    expect_id: u8,
    tx: oneshot::Sender<Message>,
}

#[derive(Default)]
struct Shared {
    pending: parking_lot::Mutex<Option<Pending>>,
    console: parking_lot::Mutex<Option<ConsoleCallback>>,
}

impl Shared {
    /// Claim the single pending-response slot, or fail fast with `Busy`.
    fn reserve(&self, expect_id: u8) -> Result<oneshot::Receiver<Message>, HubError> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return Err(HubError::Busy);
        }
        let (tx, rx) = oneshot::channel();
        *pending = Some(Pending { expect_id, tx });
        Ok(rx)
    }

    fn clear_pending(&self) {
        self.pending.lock().take();
    }
}

async fn write_frame(
    link: &mut dyn GattLink,
    msg: &Message,
    max_packet: usize,
) -> Result<(), HubError> {
    let frame = cobs::pack(&msg.serialize());
    for piece in frame.chunks(max_packet.max(1)) {
        link.write(piece).await?;
    }
    Ok(())
}

async fn await_reply(
    shared: &Shared,
    rx: oneshot::Receiver<Message>,
    timeout: Duration,
) -> Result<Message, HubError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(_)) => Err(HubError::NotConnected),
        Err(_) => {
            // Clear the slot so a timed-out request cannot block the
            // session forever.
            shared.clear_pending();
            Err(HubError::Timeout)
        }
    }
}

async fn notification_loop(mut rx: mpsc::Receiver<Vec<u8>>, shared: Arc<Shared>) {
    let mut buf: Vec<u8> = Vec::new();
    while let Some(packet) = rx.recv().await {
        buf.extend_from_slice(&packet);
        while let Some(pos) = buf.iter().position(|&b| b == cobs::DELIMITER) {
            let frame: Vec<u8> = buf.drain(..=pos).collect();
            match cobs::unpack(&frame).and_then(|payload| Message::deserialize(&payload)) {
                Ok(msg) => dispatch(msg, &shared),
                Err(e) => warn!(error = %e, "dropping malformed frame"),
            }
        }
    }
    debug!("notification stream ended");
}

fn dispatch(msg: Message, shared: &Shared) {
    if let Message::ConsoleNotification { text } = &msg {
        trace!(%text, "console notification");
        if let Some(callback) = shared.console.lock().as_ref() {
            callback(text);
        }
        return;
    }
    let mut pending = shared.pending.lock();
    let matches = pending
        .as_ref()
        .is_some_and(|p| p.expect_id == msg.id());
    if matches {
        if let Some(p) = pending.take() {
            let _ = p.tx.send(msg);
        }
    } else {
        debug!(id = msg.id(), "unsolicited message");
    }
}

/// Keep `Busy`, `RemoteQuit` and already-staged protocol errors intact;
/// name the stage on everything else.
fn stage_err(stage: ProtocolStage, e: HubError) -> HubError {
    match e {
        HubError::Protocol { .. } | HubError::Busy | HubError::RemoteQuit(_) => e,
        other => HubError::protocol(stage, other.to_string()),
    }
}

fn ensure_ack(reply: &Message, stage: ProtocolStage) -> Result<(), HubError> {
    match reply.acknowledged() {
        Some(true) => Ok(()),
        Some(false) => Err(HubError::protocol(stage, "hub rejected request")),
        None => Err(HubError::protocol(stage, "unexpected reply type")),
    }
}

/// One connected Spike Prime hub: negotiated limits, slot upload,
/// program flow control and the console side channel.
pub struct SlotSession {
    link: tokio::sync::Mutex<Box<dyn GattLink>>,
    shared: Arc<Shared>,
    info: InfoResponse,
    state: parking_lot::Mutex<SessionState>,
    last_started: parking_lot::Mutex<Option<u8>>,
    notify_task: JoinHandle<()>,
    reply_timeout: Duration,
}

impl std::fmt::Debug for SlotSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotSession").finish_non_exhaustive()
    }
}

impl SlotSession {
    /// Subscribe, then negotiate device limits with an Info exchange.
    /// A link that never answers the Info request is torn down.
    pub async fn connect(mut link: Box<dyn GattLink>) -> Result<Self, HubError> {
        let state = parking_lot::Mutex::new(SessionState::Connecting);
        let shared = Arc::new(Shared::default());
        let rx = match link.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };
        let notify_task = tokio::spawn(notification_loop(rx, shared.clone()));

        *state.lock() = SessionState::AwaitingDeviceInfo;
        debug!("subscribed, awaiting device info");
        let handshake = async {
            let reply_rx = shared.reserve(messages::INFO_RESPONSE)?;
            // Packet limit is unknown until the hub reports it; the Info
            // request frame is a handful of bytes anyway.
            write_frame(link.as_mut(), &Message::InfoRequest, usize::MAX).await?;
            await_reply(&shared, reply_rx, REPLY_TIMEOUT).await
        };
        let reply = match handshake.await {
            Ok(reply) => reply,
            Err(e) => {
                notify_task.abort();
                link.close().await;
                return Err(HubError::HandshakeFailed(format!("no info response: {e}")));
            }
        };
        let Message::InfoResponse(info) = reply else {
            notify_task.abort();
            link.close().await;
            return Err(HubError::HandshakeFailed("unexpected info reply".into()));
        };
        info!(
            max_packet = info.max_packet_size,
            max_chunk = info.max_chunk_size,
            firmware = format!("{}.{}.{}", info.firmware_major, info.firmware_minor, info.firmware_build),
            "hub limits negotiated"
        );
        *state.lock() = SessionState::Connected;

        Ok(Self {
            link: tokio::sync::Mutex::new(link),
            shared,
            info,
            state,
            last_started: parking_lot::Mutex::new(None),
            notify_task,
            reply_timeout: REPLY_TIMEOUT,
        })
    }

    pub fn info(&self) -> &InfoResponse {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Register the console callback. One callback is active at a time;
    /// registering replaces the previous one.
    pub fn set_console_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.shared.console.lock() = Some(Box::new(callback));
    }

    pub fn clear_console_callback(&self) {
        self.shared.console.lock().take();
    }

    /// Fire-and-forget write of one message, split into packets the hub
    /// accepts.
    pub async fn send_message(&self, msg: &Message) -> Result<(), HubError> {
        let mut link = self.link.lock().await;
        write_frame(link.as_mut(), msg, self.info.max_packet_size as usize).await
    }

    /// Correlated request: claim the pending slot, write, await the reply
    /// of the expected type. The slot is claimed before the link lock so
    /// a concurrent caller fails fast with `Busy` instead of queueing.
    async fn request(&self, msg: &Message, expect_id: u8) -> Result<Message, HubError> {
        let reply_rx = self.shared.reserve(expect_id)?;
        let written = {
            let mut link = self.link.lock().await;
            write_frame(link.as_mut(), msg, self.info.max_packet_size as usize).await
        };
        if let Err(e) = written {
            self.shared.clear_pending();
            return Err(e);
        }
        await_reply(&self.shared, reply_rx, self.reply_timeout).await
    }

    /// Chunked upload into a program slot: best-effort clear, then
    /// start-upload with the whole-payload CRC, then transfer chunks
    /// bounded by the negotiated size, each carrying the running CRC of
    /// everything sent so far.
    pub async fn upload_program(
        &self,
        slot: u8,
        name: &str,
        program: &[u8],
    ) -> Result<(), HubError> {
        if let Err(e) = self
            .request(&Message::ClearSlotRequest { slot }, messages::CLEAR_SLOT_RESPONSE)
            .await
        {
            // An already empty slot errors harmlessly.
            debug!(slot, error = %e, "clear slot ignored");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reply = self
            .request(
                &Message::StartFileUploadRequest {
                    name: name.to_string(),
                    slot,
                    crc: crc::crc(program, 0),
                },
                messages::START_FILE_UPLOAD_RESPONSE,
            )
            .await
            .map_err(|e| stage_err(ProtocolStage::Start, e))?;
        ensure_ack(&reply, ProtocolStage::Start)?;

        let chunk_size = (self.info.max_chunk_size as usize).max(1);
        let mut running = 0u32;
        for chunk in program.chunks(chunk_size) {
            running = crc::crc(chunk, running);
            let reply = self
                .request(
                    &Message::TransferChunkRequest {
                        running_crc: running,
                        payload: chunk.to_vec(),
                    },
                    messages::TRANSFER_CHUNK_RESPONSE,
                )
                .await
                .map_err(|e| stage_err(ProtocolStage::Chunk, e))?;
            ensure_ack(&reply, ProtocolStage::Chunk)?;
        }
        debug!(slot, bytes = program.len(), "program uploaded");
        Ok(())
    }

    /// Start the program in `slot`, waiting for the acknowledgement.
    pub async fn start_program(&self, slot: u8) -> Result<(), HubError> {
        let reply = self
            .request(
                &Message::ProgramFlowRequest { stop: false, slot },
                messages::PROGRAM_FLOW_RESPONSE,
            )
            .await
            .map_err(|e| stage_err(ProtocolStage::Flow, e))?;
        ensure_ack(&reply, ProtocolStage::Flow)?;
        *self.last_started.lock() = Some(slot);
        Ok(())
    }

    /// Start without waiting for the acknowledgement (lowest latency).
    pub async fn start_program_nowait(&self, slot: u8) -> Result<(), HubError> {
        self.send_message(&Message::ProgramFlowRequest { stop: false, slot })
            .await?;
        *self.last_started.lock() = Some(slot);
        Ok(())
    }

    pub async fn stop_program(&self, slot: u8) -> Result<(), HubError> {
        let reply = self
            .request(
                &Message::ProgramFlowRequest { stop: true, slot },
                messages::PROGRAM_FLOW_RESPONSE,
            )
            .await
            .map_err(|e| stage_err(ProtocolStage::Flow, e))?;
        ensure_ack(&reply, ProtocolStage::Flow)
    }

    /// Best-effort teardown: stop whatever was last started so the hub
    /// is never left running a program the host no longer tracks, then
    /// close the link.
    pub async fn disconnect(&self) {
        *self.state.lock() = SessionState::Disconnecting;
        let last = self.last_started.lock().take();
        if let Some(slot) = last {
            if let Err(e) = self.stop_program(slot).await {
                debug!(slot, error = %e, "stop on disconnect ignored");
            }
        }
        self.link.lock().await.close().await;
        self.notify_task.abort();
        *self.state.lock() = SessionState::Disconnected;
    }
}

impl Drop for SlotSession {
    fn drop(&mut self) {
        self.notify_task.abort();
    }
}

// ---------------------------------------------------------------------------
// btleplug-backed link
// ---------------------------------------------------------------------------

pub struct BleGattLink {
    peripheral: Peripheral,
    rx_char: btleplug::api::Characteristic,
    tx_char: btleplug::api::Characteristic,
}

impl BleGattLink {
    /// Scan for the hub (by configured address, or advertised name), then
    /// connect and resolve the two protocol characteristics.
    pub async fn connect(config: &DeviceConfig) -> Result<Self, HubError> {
        let unavailable = |e: btleplug::Error| HubError::TransportUnavailable(e.to_string());
        let manager = Manager::new().await.map_err(unavailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(unavailable)?
            .into_iter()
            .next()
            .ok_or_else(|| HubError::TransportUnavailable("no bluetooth adapter".into()))?;

        adapter
            .start_scan(ScanFilter {
                services: vec![SPIKE_SERVICE_UUID],
            })
            .await
            .map_err(unavailable)?;
        tokio::time::sleep(SCAN_WINDOW).await;
        let _ = adapter.stop_scan().await;

        let mut target = None;
        for p in adapter.peripherals().await.map_err(unavailable)? {
            let Ok(Some(props)) = p.properties().await else {
                continue;
            };
            let address = props.address.to_string();
            let address_match = config
                .ble_address
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(&address));
            let name_match = props.local_name.as_deref() == Some(config.hub_name.as_str());
            if address_match || name_match {
                debug!(%address, name = ?props.local_name, "found hub");
                target = Some(p);
                break;
            }
        }
        let peripheral = target.ok_or(HubError::ConnectTimeout(SCAN_WINDOW))?;

        let failed = |e: btleplug::Error| HubError::HandshakeFailed(e.to_string());
        peripheral.connect().await.map_err(failed)?;
        peripheral.discover_services().await.map_err(failed)?;
        let characteristics = peripheral.characteristics();
        let rx_char = characteristics
            .iter()
            .find(|c| c.uuid == SPIKE_RX_CHAR_UUID)
            .cloned()
            .ok_or_else(|| HubError::HandshakeFailed("rx characteristic not found".into()))?;
        let tx_char = characteristics
            .iter()
            .find(|c| c.uuid == SPIKE_TX_CHAR_UUID)
            .cloned()
            .ok_or_else(|| HubError::HandshakeFailed("tx characteristic not found".into()))?;
        Ok(Self {
            peripheral,
            rx_char,
            tx_char,
        })
    }
}

impl GattLink for BleGattLink {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            self.peripheral
                .write(&self.rx_char, data, WriteType::WithoutResponse)
                .await
                .map_err(|e| HubError::Io(std::io::Error::other(e)))
        })
    }

    fn subscribe(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<u8>>, HubError>> {
        Box::pin(async move {
            let failed = |e: btleplug::Error| HubError::HandshakeFailed(e.to_string());
            self.peripheral.subscribe(&self.tx_char).await.map_err(failed)?;
            let mut stream = self.peripheral.notifications().await.map_err(failed)?;
            let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
            let char_uuid = self.tx_char.uuid;
            tokio::spawn(async move {
                while let Some(ValueNotification { uuid, value }) = stream.next().await {
                    if uuid == char_uuid && tx.send(value).await.is_err() {
                        break;
                    }
                }
                debug!("ble notifications ended");
            });
            Ok(rx)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.peripheral.unsubscribe(&self.tx_char).await;
            let _ = self.peripheral.disconnect().await;
        })
    }
}
