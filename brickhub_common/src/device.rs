use serde::{Deserialize, Serialize};

/// Hub platform a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ev3,
    SpikePrime,
}

/// Which physical transport to use for an EV3 device. `Auto` tries
/// USB, then WiFi TCP, then Bluetooth RFCOMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPreference {
    #[default]
    Auto,
    Usb,
    Wifi,
    Bluetooth,
}

/// Side-channel credentials used to start the EV3 daemon when no
/// transport is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSettings {
    pub host: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_daemon_path")]
    pub daemon_path: String,
}

fn default_daemon_path() -> String {
    "/home/robot/pybricks_daemon.py".into()
}

/// Declarative device definition. Loaded externally (the host never
/// parses config files itself) and immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub platform: Platform,
    #[serde(default)]
    pub transport: TransportPreference,

    // EV3: USB serial
    #[serde(default)]
    pub usb_port: Option<String>,
    #[serde(default = "default_usb_baudrate")]
    pub usb_baudrate: u32,

    // EV3: WiFi TCP
    #[serde(default = "default_wifi_host")]
    pub wifi_host: String,
    #[serde(default = "default_wifi_port")]
    pub wifi_port: u16,

    // EV3: Bluetooth RFCOMM
    #[serde(default)]
    pub bt_address: Option<String>,
    #[serde(default = "default_bt_channel")]
    pub bt_channel: u8,

    /// Daemon bootstrap settings; `None` disables the SSH fallback.
    #[serde(default)]
    pub bootstrap: Option<BootstrapSettings>,

    // Spike Prime: BLE
    #[serde(default)]
    pub ble_address: Option<String>,
    #[serde(default = "default_hub_name")]
    pub hub_name: String,
    /// Preferred program slot on the hub.
    #[serde(default = "default_slot")]
    pub slot: u8,
}

fn default_usb_baudrate() -> u32 {
    115200
}

fn default_wifi_host() -> String {
    "ev3dev.local".into()
}

fn default_wifi_port() -> u16 {
    9000
}

fn default_bt_channel() -> u8 {
    1
}

fn default_hub_name() -> String {
    "Spike Prime".into()
}

fn default_slot() -> u8 {
    19
}

impl DeviceConfig {
    pub fn ev3(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: Platform::Ev3,
            transport: TransportPreference::Auto,
            usb_port: None,
            usb_baudrate: default_usb_baudrate(),
            wifi_host: default_wifi_host(),
            wifi_port: default_wifi_port(),
            bt_address: None,
            bt_channel: default_bt_channel(),
            bootstrap: None,
            ble_address: None,
            hub_name: default_hub_name(),
            slot: default_slot(),
        }
    }

    pub fn spike(name: impl Into<String>, ble_address: impl Into<String>) -> Self {
        let mut cfg = Self::ev3(name);
        cfg.platform = Platform::SpikePrime;
        cfg.ble_address = Some(ble_address.into());
        cfg
    }

    pub fn with_wifi(mut self, host: impl Into<String>, port: u16) -> Self {
        self.wifi_host = host.into();
        self.wifi_port = port;
        self
    }

    pub fn with_transport(mut self, transport: TransportPreference) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_bootstrap(mut self, settings: BootstrapSettings) -> Self {
        self.bootstrap = Some(settings);
        self
    }
}

/// One dispatchable unit of work: a named action routed to a named device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub device: String,
    pub action: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Action {
    pub fn new(device: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            action: action.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}
