//! In-memory hub simulator used by session and executor tests. Speaks the
//! real framing (COBS pack/unpack, running CRC verification) over channel
//! pairs so the code under test exercises the same byte paths as a BLE
//! link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brickhub_common::error::HubError;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::cobs;
use super::crc;
use super::messages::{InfoResponse, Message};
use super::session::GattLink;

struct Upload {
    slot: u8,
    running: u32,
    data: Vec<u8>,
}

pub(crate) struct FakeHub {
    to_host: mpsc::Sender<Vec<u8>>,
    from_hub: Option<mpsc::Receiver<Vec<u8>>>,
    console_tx: mpsc::Sender<String>,
    buf: Vec<u8>,
    max_packet: u16,
    max_chunk: u16,
    mute: bool,
    reject_uploads: bool,
    drop_flow_replies: bool,
    reply_delay: Option<Duration>,
    done_limit: usize,
    upload: Option<Upload>,
    chunks: Arc<AtomicUsize>,
    flow_starts: Arc<AtomicUsize>,
    flow_stops: Arc<AtomicUsize>,
    upload_starts: Arc<AtomicUsize>,
    programs: Arc<parking_lot::Mutex<HashMap<u8, Vec<u8>>>>,
}

impl FakeHub {
    pub(crate) fn new(max_packet: u16, max_chunk: u16) -> Self {
        let (to_host, from_hub) = mpsc::channel::<Vec<u8>>(64);
        let (console_tx, mut console_rx) = mpsc::channel::<String>(16);
        let forward = to_host.clone();
        let packet = max_packet as usize;
        tokio::spawn(async move {
            while let Some(text) = console_rx.recv().await {
                let frame = cobs::pack(&Message::ConsoleNotification { text }.serialize());
                for piece in frame.chunks(packet) {
                    if forward.send(piece.to_vec()).await.is_err() {
                        return;
                    }
                }
            }
        });
        Self {
            to_host,
            from_hub: Some(from_hub),
            console_tx,
            buf: Vec::new(),
            max_packet,
            max_chunk,
            mute: false,
            reject_uploads: false,
            drop_flow_replies: false,
            reply_delay: None,
            done_limit: usize::MAX,
            upload: None,
            chunks: Arc::new(AtomicUsize::new(0)),
            flow_starts: Arc::new(AtomicUsize::new(0)),
            flow_stops: Arc::new(AtomicUsize::new(0)),
            upload_starts: Arc::new(AtomicUsize::new(0)),
            programs: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    /// Never reply to anything.
    pub(crate) fn mute(mut self) -> Self {
        self.mute = true;
        self
    }

    /// Reject every start-upload request.
    pub(crate) fn reject_uploads(mut self) -> Self {
        self.reject_uploads = true;
        self
    }

    /// Swallow program-flow replies so correlated flow requests time out.
    pub(crate) fn drop_flow_replies(mut self) -> Self {
        self.drop_flow_replies = true;
        self
    }

    pub(crate) fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }

    /// Emit at most `limit` DONE console lines per program start.
    pub(crate) fn with_done_limit(mut self, limit: usize) -> Self {
        self.done_limit = limit;
        self
    }

    pub(crate) fn chunk_count(&self) -> Arc<AtomicUsize> {
        self.chunks.clone()
    }

    pub(crate) fn flow_start_count(&self) -> Arc<AtomicUsize> {
        self.flow_starts.clone()
    }

    pub(crate) fn stop_count(&self) -> Arc<AtomicUsize> {
        self.flow_stops.clone()
    }

    pub(crate) fn upload_start_count(&self) -> Arc<AtomicUsize> {
        self.upload_starts.clone()
    }

    pub(crate) fn programs(&self) -> Arc<parking_lot::Mutex<HashMap<u8, Vec<u8>>>> {
        self.programs.clone()
    }

    /// Push an out-of-band console notification through the notify path.
    pub(crate) fn console_injector(&self) -> mpsc::Sender<String> {
        self.console_tx.clone()
    }

    async fn reply(&self, msg: Message) {
        let frame = cobs::pack(&msg.serialize());
        let pieces: Vec<Vec<u8>> = frame
            .chunks(self.max_packet as usize)
            .map(<[u8]>::to_vec)
            .collect();
        let tx = self.to_host.clone();
        match self.reply_delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for piece in pieces {
                        if tx.send(piece).await.is_err() {
                            return;
                        }
                    }
                });
            }
            None => {
                for piece in pieces {
                    let _ = tx.send(piece).await;
                }
            }
        }
    }

    fn emit_done_lines(&self, program: &[u8]) {
        let text = String::from_utf8_lossy(program);
        let steps = text.matches("DONE:").count().min(self.done_limit);
        if steps == 0 {
            return;
        }
        let tx = self.console_tx.clone();
        tokio::spawn(async move {
            for i in 0..steps {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if tx.send(format!("DONE:{i}")).await.is_err() {
                    return;
                }
            }
        });
    }

    async fn handle(&mut self, msg: Message) {
        if self.mute {
            return;
        }
        match msg {
            Message::InfoRequest => {
                self.reply(Message::InfoResponse(InfoResponse {
                    rpc_major: 1,
                    rpc_minor: 0,
                    rpc_build: 0,
                    firmware_major: 1,
                    firmware_minor: 5,
                    firmware_build: 79,
                    max_packet_size: self.max_packet,
                    max_message_size: 8192,
                    max_chunk_size: self.max_chunk,
                    product_group: 1,
                }))
                .await;
            }
            Message::ClearSlotRequest { slot } => {
                self.programs.lock().remove(&slot);
                self.reply(Message::ClearSlotResponse { acknowledged: true })
                    .await;
            }
            Message::StartFileUploadRequest { slot, .. } => {
                self.upload_starts.fetch_add(1, Ordering::SeqCst);
                let acknowledged = !self.reject_uploads;
                if acknowledged {
                    self.upload = Some(Upload {
                        slot,
                        running: 0,
                        data: Vec::new(),
                    });
                }
                self.reply(Message::StartFileUploadResponse { acknowledged })
                    .await;
            }
            Message::TransferChunkRequest {
                running_crc,
                payload,
            } => {
                self.chunks.fetch_add(1, Ordering::SeqCst);
                let within_limit = payload.len() <= self.max_chunk as usize;
                let acknowledged = match self.upload.as_mut() {
                    Some(up) if within_limit => {
                        up.running = crc::crc(&payload, up.running);
                        if up.running == running_crc {
                            up.data.extend_from_slice(&payload);
                            self.programs.lock().insert(up.slot, up.data.clone());
                            true
                        } else {
                            false
                        }
                    }
                    _ => false,
                };
                self.reply(Message::TransferChunkResponse { acknowledged })
                    .await;
            }
            Message::ProgramFlowRequest { stop: false, slot } => {
                self.flow_starts.fetch_add(1, Ordering::SeqCst);
                if let Some(program) = self.programs.lock().get(&slot).cloned() {
                    self.emit_done_lines(&program);
                }
                if !self.drop_flow_replies {
                    self.reply(Message::ProgramFlowResponse { acknowledged: true })
                        .await;
                }
            }
            Message::ProgramFlowRequest { stop: true, .. } => {
                self.flow_stops.fetch_add(1, Ordering::SeqCst);
                self.reply(Message::ProgramFlowResponse { acknowledged: true })
                    .await;
            }
            other => panic!("hub received unexpected message: {other:?}"),
        }
    }
}

impl GattLink for FakeHub {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            assert!(
                data.len() <= self.max_packet as usize,
                "write of {} bytes exceeds packet limit {}",
                data.len(),
                self.max_packet
            );
            self.buf.extend_from_slice(data);
            while let Some(pos) = self.buf.iter().position(|&b| b == cobs::DELIMITER) {
                let frame: Vec<u8> = self.buf.drain(..=pos).collect();
                let msg = Message::deserialize(&cobs::unpack(&frame).unwrap()).unwrap();
                self.handle(msg).await;
            }
            Ok(())
        })
    }

    fn subscribe(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<u8>>, HubError>> {
        Box::pin(async move {
            self.from_hub
                .take()
                .ok_or_else(|| HubError::HandshakeFailed("already subscribed".into()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {})
    }
}
