//! Host-side remote control for LEGO EV3 and Spike Prime hubs.
//!
//! Three layers, leaves first:
//! - [`transport`]: USB serial / WiFi TCP / Bluetooth RFCOMM transports for
//!   the EV3 line protocol.
//! - [`ev3`] and [`spike`]: per-platform sessions (line request/response for
//!   EV3, framed slot upload protocol over BLE GATT for Spike Prime).
//! - [`conductor`] and [`collab`]: multi-device orchestration and the
//!   collaboration patterns that coordinate hubs with no shared clock.

pub mod bootstrap;
pub mod collab;
pub mod conductor;
pub mod ev3;
pub mod spike;
pub mod transport;

/// Route crate logs to the test harness; `RUST_LOG` filters as usual.
/// Later calls are no-ops once a subscriber is installed.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
