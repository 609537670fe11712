//! Message types of the Spike Prime App 3 slot protocol. Wire encoding is
//! little-endian, message id first. Responses carry a single status byte
//! where 0x00 means acknowledged.

use brickhub_common::error::{HubError, ProtocolStage};

pub const INFO_REQUEST: u8 = 0x00;
pub const INFO_RESPONSE: u8 = 0x01;
pub const START_FILE_UPLOAD_REQUEST: u8 = 0x0c;
pub const START_FILE_UPLOAD_RESPONSE: u8 = 0x0d;
pub const TRANSFER_CHUNK_REQUEST: u8 = 0x10;
pub const TRANSFER_CHUNK_RESPONSE: u8 = 0x11;
pub const PROGRAM_FLOW_REQUEST: u8 = 0x1e;
pub const PROGRAM_FLOW_RESPONSE: u8 = 0x1f;
pub const CONSOLE_NOTIFICATION: u8 = 0x21;
pub const CLEAR_SLOT_REQUEST: u8 = 0x46;
pub const CLEAR_SLOT_RESPONSE: u8 = 0x47;

/// Limits and version info reported by the hub. All later framing must
/// respect the reported sizes; the hub rejects oversized writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoResponse {
    pub rpc_major: u8,
    pub rpc_minor: u8,
    pub rpc_build: u16,
    pub firmware_major: u8,
    pub firmware_minor: u8,
    pub firmware_build: u16,
    pub max_packet_size: u16,
    pub max_message_size: u16,
    pub max_chunk_size: u16,
    pub product_group: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    InfoRequest,
    InfoResponse(InfoResponse),
    ClearSlotRequest { slot: u8 },
    ClearSlotResponse { acknowledged: bool },
    StartFileUploadRequest { name: String, slot: u8, crc: u32 },
    StartFileUploadResponse { acknowledged: bool },
    TransferChunkRequest { running_crc: u32, payload: Vec<u8> },
    TransferChunkResponse { acknowledged: bool },
    ProgramFlowRequest { stop: bool, slot: u8 },
    ProgramFlowResponse { acknowledged: bool },
    ConsoleNotification { text: String },
}

impl Message {
    pub fn id(&self) -> u8 {
        match self {
            Message::InfoRequest => INFO_REQUEST,
            Message::InfoResponse(_) => INFO_RESPONSE,
            Message::ClearSlotRequest { .. } => CLEAR_SLOT_REQUEST,
            Message::ClearSlotResponse { .. } => CLEAR_SLOT_RESPONSE,
            Message::StartFileUploadRequest { .. } => START_FILE_UPLOAD_REQUEST,
            Message::StartFileUploadResponse { .. } => START_FILE_UPLOAD_RESPONSE,
            Message::TransferChunkRequest { .. } => TRANSFER_CHUNK_REQUEST,
            Message::TransferChunkResponse { .. } => TRANSFER_CHUNK_RESPONSE,
            Message::ProgramFlowRequest { .. } => PROGRAM_FLOW_REQUEST,
            Message::ProgramFlowResponse { .. } => PROGRAM_FLOW_RESPONSE,
            Message::ConsoleNotification { .. } => CONSOLE_NOTIFICATION,
        }
    }

    /// Acknowledgement status for response messages, `None` otherwise.
    pub fn acknowledged(&self) -> Option<bool> {
        match self {
            Message::ClearSlotResponse { acknowledged }
            | Message::StartFileUploadResponse { acknowledged }
            | Message::TransferChunkResponse { acknowledged }
            | Message::ProgramFlowResponse { acknowledged } => Some(*acknowledged),
            _ => None,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![self.id()];
        match self {
            Message::InfoRequest => {}
            Message::InfoResponse(info) => {
                out.push(info.rpc_major);
                out.push(info.rpc_minor);
                out.extend_from_slice(&info.rpc_build.to_le_bytes());
                out.push(info.firmware_major);
                out.push(info.firmware_minor);
                out.extend_from_slice(&info.firmware_build.to_le_bytes());
                out.extend_from_slice(&info.max_packet_size.to_le_bytes());
                out.extend_from_slice(&info.max_message_size.to_le_bytes());
                out.extend_from_slice(&info.max_chunk_size.to_le_bytes());
                out.extend_from_slice(&info.product_group.to_le_bytes());
            }
            Message::ClearSlotRequest { slot } => out.push(*slot),
            Message::StartFileUploadRequest { name, slot, crc } => {
                out.extend_from_slice(name.as_bytes());
                out.push(0); // NUL-terminated name
                out.push(*slot);
                out.extend_from_slice(&crc.to_le_bytes());
            }
            Message::TransferChunkRequest { running_crc, payload } => {
                out.extend_from_slice(&running_crc.to_le_bytes());
                out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
                out.extend_from_slice(payload);
            }
            Message::ProgramFlowRequest { stop, slot } => {
                out.push(u8::from(*stop));
                out.push(*slot);
            }
            Message::ConsoleNotification { text } => out.extend_from_slice(text.as_bytes()),
            Message::ClearSlotResponse { acknowledged }
            | Message::StartFileUploadResponse { acknowledged }
            | Message::TransferChunkResponse { acknowledged }
            | Message::ProgramFlowResponse { acknowledged } => {
                out.push(if *acknowledged { 0x00 } else { 0x01 });
            }
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Message, HubError> {
        let malformed = |what: &str| HubError::protocol(ProtocolStage::Frame, format!("malformed {what} message"));
        let Some((&id, body)) = data.split_first() else {
            return Err(malformed("empty"));
        };
        let ack = |body: &[u8], what: &str| -> Result<bool, HubError> {
            body.first().map(|&b| b == 0x00).ok_or_else(|| malformed(what))
        };
        let msg = match id {
            INFO_REQUEST => Message::InfoRequest,
            INFO_RESPONSE => {
                if body.len() < 16 {
                    return Err(malformed("info response"));
                }
                Message::InfoResponse(InfoResponse {
                    rpc_major: body[0],
                    rpc_minor: body[1],
                    rpc_build: u16::from_le_bytes([body[2], body[3]]),
                    firmware_major: body[4],
                    firmware_minor: body[5],
                    firmware_build: u16::from_le_bytes([body[6], body[7]]),
                    max_packet_size: u16::from_le_bytes([body[8], body[9]]),
                    max_message_size: u16::from_le_bytes([body[10], body[11]]),
                    max_chunk_size: u16::from_le_bytes([body[12], body[13]]),
                    product_group: u16::from_le_bytes([body[14], body[15]]),
                })
            }
            CLEAR_SLOT_REQUEST => Message::ClearSlotRequest {
                slot: *body.first().ok_or_else(|| malformed("clear slot"))?,
            },
            CLEAR_SLOT_RESPONSE => Message::ClearSlotResponse {
                acknowledged: ack(body, "clear slot response")?,
            },
            START_FILE_UPLOAD_REQUEST => {
                let nul = body
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| malformed("start upload"))?;
                let name = String::from_utf8_lossy(&body[..nul]).into_owned();
                let rest = &body[nul + 1..];
                if rest.len() < 5 {
                    return Err(malformed("start upload"));
                }
                Message::StartFileUploadRequest {
                    name,
                    slot: rest[0],
                    crc: u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]),
                }
            }
            START_FILE_UPLOAD_RESPONSE => Message::StartFileUploadResponse {
                acknowledged: ack(body, "start upload response")?,
            },
            TRANSFER_CHUNK_REQUEST => {
                if body.len() < 6 {
                    return Err(malformed("transfer chunk"));
                }
                let running_crc = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let size = u16::from_le_bytes([body[4], body[5]]) as usize;
                let payload = body.get(6..6 + size).ok_or_else(|| malformed("transfer chunk"))?;
                Message::TransferChunkRequest {
                    running_crc,
                    payload: payload.to_vec(),
                }
            }
            TRANSFER_CHUNK_RESPONSE => Message::TransferChunkResponse {
                acknowledged: ack(body, "transfer chunk response")?,
            },
            PROGRAM_FLOW_REQUEST => {
                if body.len() < 2 {
                    return Err(malformed("program flow"));
                }
                Message::ProgramFlowRequest {
                    stop: body[0] != 0,
                    slot: body[1],
                }
            }
            PROGRAM_FLOW_RESPONSE => Message::ProgramFlowResponse {
                acknowledged: ack(body, "program flow response")?,
            },
            CONSOLE_NOTIFICATION => {
                let end = body.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                Message::ConsoleNotification {
                    text: String::from_utf8_lossy(&body[..end]).into_owned(),
                }
            }
            other => {
                return Err(HubError::protocol(
                    ProtocolStage::Frame,
                    format!("unknown message id {other:#04x}"),
                ))
            }
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_response_fields_from_raw_bytes() {
        // rpc 1.0 build 37, fw 1.5 build 79, packet 509, message 8192,
        // chunk 400, product group 1.
        let raw = [
            0x01, 1, 0, 37, 0, 1, 5, 79, 0, 0xfd, 0x01, 0x00, 0x20, 0x90, 0x01, 0x01, 0x00,
        ];
        let msg = Message::deserialize(&raw).unwrap();
        let Message::InfoResponse(info) = msg else {
            panic!("expected info response");
        };
        assert_eq!(info.max_packet_size, 509);
        assert_eq!(info.max_message_size, 8192);
        assert_eq!(info.max_chunk_size, 400);
        assert_eq!(info.product_group, 1);
    }

    #[test]
    fn start_upload_carries_nul_terminated_name() {
        let msg = Message::StartFileUploadRequest {
            name: "program.py".into(),
            slot: 18,
            crc: 0xdead_beef,
        };
        let bytes = msg.serialize();
        assert_eq!(bytes[0], START_FILE_UPLOAD_REQUEST);
        assert_eq!(&bytes[1..11], b"program.py");
        assert_eq!(bytes[11], 0);
        assert_eq!(bytes[12], 18);
        assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn transfer_chunk_preserves_payload() {
        let msg = Message::TransferChunkRequest {
            running_crc: 42,
            payload: vec![9, 8, 7, 0, 2],
        };
        assert_eq!(Message::deserialize(&msg.serialize()).unwrap(), msg);
    }

    #[test]
    fn console_text_strips_trailing_nuls() {
        let mut raw = vec![CONSOLE_NOTIFICATION];
        raw.extend_from_slice(b"DONE:3\0\0\0");
        let msg = Message::deserialize(&raw).unwrap();
        assert_eq!(msg, Message::ConsoleNotification { text: "DONE:3".into() });
    }

    #[test]
    fn response_status_byte() {
        let ok = Message::deserialize(&[PROGRAM_FLOW_RESPONSE, 0x00]).unwrap();
        assert_eq!(ok.acknowledged(), Some(true));
        let nak = Message::deserialize(&[PROGRAM_FLOW_RESPONSE, 0x23]).unwrap();
        assert_eq!(nak.acknowledged(), Some(false));
        assert!(Message::deserialize(&[0x7f]).is_err());
    }
}
