//! Spike Prime (App 3 firmware) support: COBS framing, running CRC,
//! the slot upload protocol over BLE GATT, MicroPython program
//! synthesis, and the pre-uploaded-slot fast executor.

pub mod cobs;
pub mod crc;
pub mod executor;
pub mod messages;
pub mod programs;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;
