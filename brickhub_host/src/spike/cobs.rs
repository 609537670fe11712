//! Byte stuffing for the Spike Prime BLE link (the LEGO App 3 variant of
//! COBS). Frames on the wire are XOR-scrambled and terminated by a single
//! 0x02 delimiter; the stuffing guarantees the body never contains one.
//!
//! Each block starts with a code byte. `0xff` means "84 data bytes, no
//! delimiter value". Any other code encodes both the block length and
//! which low byte value (0, 1 or 2) terminated the block.

use brickhub_common::error::{HubError, ProtocolStage};

/// Frame terminator byte.
pub const DELIMITER: u8 = 0x02;
/// Prefix marking a high-priority inbound frame.
pub const PRIORITY: u8 = 0x01;

const NO_DELIMITER: u8 = 0xff;
const CODE_OFFSET: usize = 0x02;
const MAX_BLOCK_SIZE: usize = 84;
const XOR: u8 = 0x03;

/// Stuff `data` so that no byte of the output is `<= DELIMITER`.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + data.len() / MAX_BLOCK_SIZE + 2);
    let mut code_index = buf.len();
    buf.push(NO_DELIMITER);
    let mut block = 1usize;

    for &byte in data {
        if byte > DELIMITER {
            buf.push(byte);
            block += 1;
        }
        if byte <= DELIMITER || block > MAX_BLOCK_SIZE {
            if byte <= DELIMITER {
                let delimiter_base = byte as usize * MAX_BLOCK_SIZE;
                buf[code_index] = (delimiter_base + block + CODE_OFFSET) as u8;
            }
            code_index = buf.len();
            buf.push(NO_DELIMITER);
            block = 1;
        }
    }
    buf[code_index] = (block + CODE_OFFSET) as u8;
    buf
}

/// Invert [`encode`]. Fails on code bytes that cannot appear in a
/// well-formed stream.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, HubError> {
    fn unescape(code: u8) -> Result<(Option<u8>, usize), HubError> {
        if code == NO_DELIMITER {
            return Ok((None, MAX_BLOCK_SIZE + 1));
        }
        let adjusted = (code as usize)
            .checked_sub(CODE_OFFSET + 1)
            .ok_or_else(|| HubError::protocol(ProtocolStage::Frame, format!("bad code byte {code:#04x}")))?
            + 1;
        let mut value = adjusted / MAX_BLOCK_SIZE;
        let mut block = adjusted % MAX_BLOCK_SIZE;
        if block == 0 {
            block = MAX_BLOCK_SIZE;
            value -= 1;
        }
        Ok((Some(value as u8), block))
    }

    let Some((&first, rest)) = data.split_first() else {
        return Err(HubError::protocol(ProtocolStage::Frame, "empty frame"));
    };
    let (mut value, mut block) = unescape(first)?;
    let mut buf = Vec::with_capacity(data.len());
    for &byte in rest {
        block -= 1;
        if block > 0 {
            buf.push(byte);
            continue;
        }
        if let Some(v) = value {
            buf.push(v);
        }
        (value, block) = unescape(byte)?;
    }
    Ok(buf)
}

/// Encode, scramble, and append the frame delimiter. The scramble keeps
/// 0x03 (ctrl-C, which the hub console intercepts) off the wire; stuffed
/// bytes are all `> DELIMITER`, so scrambled bytes never collide with the
/// delimiter or priority prefix either.
pub fn pack(data: &[u8]) -> Vec<u8> {
    let mut frame = encode(data);
    for byte in &mut frame {
        *byte ^= XOR;
    }
    frame.push(DELIMITER);
    frame
}

/// Invert [`pack`] on a full frame (including the trailing delimiter).
/// An optional leading priority byte is skipped.
pub fn unpack(frame: &[u8]) -> Result<Vec<u8>, HubError> {
    let mut body = frame;
    if body.first() == Some(&PRIORITY) {
        body = &body[1..];
    }
    let Some((&last, body)) = body.split_last() else {
        return Err(HubError::protocol(ProtocolStage::Frame, "empty frame"));
    };
    if last != DELIMITER {
        return Err(HubError::protocol(ProtocolStage::Frame, "missing frame delimiter"));
    }
    let unscrambled: Vec<u8> = body.iter().map(|&b| b ^ XOR).collect();
    decode(&unscrambled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: &[u8]) {
        let frame = pack(payload);
        assert_eq!(unpack(&frame).unwrap(), payload, "payload {payload:?}");
    }

    #[test]
    fn round_trips_payloads_with_low_bytes() {
        round_trip(b"");
        round_trip(&[0x00]);
        round_trip(&[0x02]);
        round_trip(&[0x00, 0x01, 0x02, 0x03]);
        round_trip(&[0x02; 10]);
        round_trip(b"print(\"DONE:0\")\n");
    }

    #[test]
    fn round_trips_long_payloads() {
        // Longer than one 84-byte block, forcing NO_DELIMITER codes.
        let long: Vec<u8> = (0u8..=255).cycle().take(500).collect();
        round_trip(&long);
        let high: Vec<u8> = vec![0xaa; 300];
        round_trip(&high);
    }

    #[test]
    fn packed_body_never_contains_delimiter() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let frame = pack(&payload);
        let (last, body) = frame.split_last().unwrap();
        assert_eq!(*last, DELIMITER);
        assert!(!body.contains(&DELIMITER));
        assert!(!body.contains(&PRIORITY));
    }

    #[test]
    fn skips_priority_prefix() {
        let mut frame = pack(b"hello");
        frame.insert(0, PRIORITY);
        assert_eq!(unpack(&frame).unwrap(), b"hello");
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(unpack(&[]).is_err());
        assert!(unpack(&[0x42]).is_err()); // no delimiter
        // Body byte 0x01 unscrambles to the invalid code 0x02.
        assert!(unpack(&[0x01, 0x01, DELIMITER]).is_err());
    }
}
