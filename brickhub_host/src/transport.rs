//! Physical transports for the EV3 line protocol: USB serial, WiFi TCP
//! and Bluetooth RFCOMM. Blocking backends (serial, RFCOMM) run their
//! reads and writes on the blocking pool; the TCP backend is native async.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use brickhub_common::device::DeviceConfig;
use brickhub_common::error::HubError;
use futures::future::BoxFuture;
use serialport::{SerialPort, SerialPortType};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Object-safe async transport. Exclusively owned by the link that
/// opened it; never shared or pooled.
pub trait Transport: Send {
    /// Human-readable name for logging, e.g. `usb:/dev/ttyACM0`.
    fn name(&self) -> String;

    fn is_connected(&self) -> bool;

    fn connect(&mut self) -> BoxFuture<'_, Result<(), HubError>>;

    fn disconnect(&mut self) -> BoxFuture<'_, ()>;

    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), HubError>>;

    /// Read one newline-terminated line, trimmed. `HubError::Timeout`
    /// when no full line arrives within `timeout`.
    fn receive_line(&mut self, timeout: Duration) -> BoxFuture<'_, Result<String, HubError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Usb,
    Wifi,
    Bluetooth,
}

/// Builds concrete transports for a device. The indirection exists so
/// link-level logic (auto-detect order, READY handshake, bootstrap
/// retries) is testable with in-memory transports.
pub trait TransportFactory: Send + Sync {
    /// `None` when the transport cannot be built for this device at all
    /// (e.g. no Bluetooth address configured), which auto-detect treats
    /// as "skip", not "fail".
    fn create(&self, kind: TransportKind, config: &DeviceConfig) -> Option<Box<dyn Transport>>;
}

pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, kind: TransportKind, config: &DeviceConfig) -> Option<Box<dyn Transport>> {
        match kind {
            TransportKind::Usb => Some(Box::new(UsbSerialTransport::new(
                config.usb_port.clone(),
                config.usb_baudrate,
            ))),
            TransportKind::Wifi => Some(Box::new(WifiTcpTransport::new(
                config.wifi_host.clone(),
                config.wifi_port,
            ))),
            TransportKind::Bluetooth => config.bt_address.as_ref().map(|addr| {
                Box::new(BluetoothRfcommTransport::new(addr.clone(), config.bt_channel))
                    as Box<dyn Transport>
            }),
        }
    }
}

/// Blocking line read over a `Read` with short per-call timeouts
/// configured on the handle. Shared by the serial and RFCOMM backends.
fn read_line_blocking<R: Read>(reader: &mut R, timeout: Duration) -> Result<String, HubError> {
    use std::io::ErrorKind;
    let deadline = Instant::now() + timeout;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(HubError::NotConnected),
            Ok(_) => {
                if byte[0] == b'\n' {
                    return Ok(String::from_utf8_lossy(&line).trim().to_string());
                }
                line.push(byte[0]);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                if Instant::now() >= deadline {
                    return Err(HubError::Timeout);
                }
            }
            Err(e) => return Err(HubError::Io(e)),
        }
    }
}

fn join_err(e: tokio::task::JoinError) -> HubError {
    HubError::Io(std::io::Error::other(e))
}

// ---------------------------------------------------------------------------
// USB serial
// ---------------------------------------------------------------------------

pub struct UsbSerialTransport {
    port_name: Option<String>,
    baudrate: u32,
    port: Option<Box<dyn SerialPort>>,
    label: String,
}

impl UsbSerialTransport {
    pub fn new(port_name: Option<String>, baudrate: u32) -> Self {
        Self {
            port_name,
            baudrate,
            port: None,
            label: "usb:?".into(),
        }
    }

    /// Scan serial ports for a LEGO/EV3 USB device, falling back to the
    /// first port that looks like a USB modem.
    pub fn find_ev3_port() -> Option<String> {
        let ports = serialport::available_ports().ok()?;
        for info in &ports {
            if let SerialPortType::UsbPort(usb) = &info.port_type {
                let product = usb.product.as_deref().unwrap_or("").to_ascii_lowercase();
                let manufacturer = usb.manufacturer.as_deref().unwrap_or("").to_ascii_lowercase();
                if ["lego", "ev3", "mindstorms"]
                    .iter()
                    .any(|tag| product.contains(tag) || manufacturer.contains(tag))
                {
                    return Some(info.port_name.clone());
                }
            }
        }
        ports
            .iter()
            .map(|info| &info.port_name)
            .find(|name| {
                name.contains("ttyACM") || name.contains("ttyUSB") || name.contains("usbmodem")
            })
            .cloned()
    }
}

impl Transport for UsbSerialTransport {
    fn name(&self) -> String {
        self.label.clone()
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn connect(&mut self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            let Some(port_name) = self.port_name.clone().or_else(Self::find_ev3_port) else {
                return Err(HubError::TransportUnavailable(
                    "no EV3 USB serial device found".into(),
                ));
            };
            let baudrate = self.baudrate;
            let opened = tokio::task::spawn_blocking(move || {
                let port = serialport::new(&port_name, baudrate)
                    .timeout(POLL_INTERVAL)
                    .open()
                    .map_err(|e| HubError::TransportUnavailable(e.to_string()))?;
                Ok::<_, HubError>((port, port_name))
            })
            .await
            .map_err(join_err)??;
            let (port, port_name) = opened;
            debug!(port = %port_name, baudrate, "usb serial open");
            self.label = format!("usb:{port_name}");
            self.port = Some(port);
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.port = None;
        })
    }

    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            let mut port = self.port.take().ok_or(HubError::NotConnected)?;
            let data = data.to_vec();
            let (port, result) = tokio::task::spawn_blocking(move || {
                let result = port
                    .write_all(&data)
                    .and_then(|()| port.flush())
                    .map_err(HubError::Io);
                (port, result)
            })
            .await
            .map_err(join_err)?;
            self.port = Some(port);
            result
        })
    }

    fn receive_line(&mut self, timeout: Duration) -> BoxFuture<'_, Result<String, HubError>> {
        Box::pin(async move {
            let mut port = self.port.take().ok_or(HubError::NotConnected)?;
            let (port, result) = tokio::task::spawn_blocking(move || {
                let result = read_line_blocking(&mut port, timeout);
                (port, result)
            })
            .await
            .map_err(join_err)?;
            self.port = Some(port);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// WiFi TCP
// ---------------------------------------------------------------------------

pub struct WifiTcpTransport {
    host: String,
    port: u16,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    // Bytes of a line whose newline has not arrived yet. Kept across
    // calls so a read timeout mid-line does not discard them.
    partial: Vec<u8>,
}

impl WifiTcpTransport {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            reader: None,
            writer: None,
            partial: Vec::new(),
        }
    }
}

impl Transport for WifiTcpTransport {
    fn name(&self) -> String {
        format!("wifi:{}:{}", self.host, self.port)
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    fn connect(&mut self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((self.host.as_str(), self.port)),
            )
            .await
            .map_err(|_| HubError::ConnectTimeout(CONNECT_TIMEOUT))??;
            stream.set_nodelay(true)?;
            debug!(host = %self.host, port = self.port, "tcp connected");
            let (read_half, write_half) = stream.into_split();
            self.reader = Some(BufReader::new(read_half));
            self.writer = Some(write_half);
            self.partial.clear();
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut writer) = self.writer.take() {
                let _ = writer.shutdown().await;
            }
            self.reader = None;
            self.partial.clear();
        })
    }

    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            let writer = self.writer.as_mut().ok_or(HubError::NotConnected)?;
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok(())
        })
    }

    fn receive_line(&mut self, timeout: Duration) -> BoxFuture<'_, Result<String, HubError>> {
        Box::pin(async move {
            let reader = self.reader.as_mut().ok_or(HubError::NotConnected)?;
            // read_until appends into `partial` as bytes arrive, so a
            // timeout here leaves the half-read line in place and the
            // next call resumes it instead of returning a truncated one.
            let n = tokio::time::timeout(timeout, reader.read_until(b'\n', &mut self.partial))
                .await
                .map_err(|_| HubError::Timeout)??;
            if n == 0 {
                return Err(HubError::NotConnected);
            }
            let line = String::from_utf8_lossy(&self.partial).trim().to_string();
            self.partial.clear();
            Ok(line)
        })
    }
}

// ---------------------------------------------------------------------------
// Bluetooth RFCOMM
// ---------------------------------------------------------------------------

pub struct BluetoothRfcommTransport {
    address: String,
    channel: u8,
    socket: Option<socket2::Socket>,
}

impl BluetoothRfcommTransport {
    pub fn new(address: String, channel: u8) -> Self {
        Self {
            address,
            channel,
            socket: None,
        }
    }
}

#[cfg(target_os = "linux")]
mod rfcomm {
    use super::*;
    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    const AF_BLUETOOTH: i32 = 31;
    const BTPROTO_RFCOMM: i32 = 3;
    // struct sockaddr_rc: u16 family, 6-byte bdaddr, u8 channel.
    const SOCKADDR_RC_LEN: u32 = 10;

    fn parse_bdaddr(address: &str) -> Result<[u8; 6], HubError> {
        let mut mac = [0u8; 6];
        let mut parts = address.split(':');
        for byte in &mut mac {
            let part = parts.next().ok_or_else(|| {
                HubError::TransportUnavailable(format!("bad bluetooth address {address:?}"))
            })?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| {
                HubError::TransportUnavailable(format!("bad bluetooth address {address:?}"))
            })?;
        }
        if parts.next().is_some() {
            return Err(HubError::TransportUnavailable(format!(
                "bad bluetooth address {address:?}"
            )));
        }
        Ok(mac)
    }

    fn rfcomm_sockaddr(address: &str, channel: u8) -> Result<SockAddr, HubError> {
        let mac = parse_bdaddr(address)?;
        let ((), addr) = unsafe {
            SockAddr::try_init(|storage, len| {
                let bytes = storage.cast::<u8>();
                bytes.cast::<u16>().write(AF_BLUETOOTH as u16);
                // bdaddr_t is stored in reverse octet order.
                for (i, b) in mac.iter().rev().enumerate() {
                    bytes.add(2 + i).write(*b);
                }
                bytes.add(8).write(channel);
                *len = SOCKADDR_RC_LEN;
                Ok(())
            })
        }?;
        Ok(addr)
    }

    pub fn connect_blocking(address: &str, channel: u8) -> Result<Socket, HubError> {
        let addr = rfcomm_sockaddr(address, channel)?;
        let socket = Socket::new(
            Domain::from(AF_BLUETOOTH),
            Type::STREAM,
            Some(Protocol::from(BTPROTO_RFCOMM)),
        )?;
        socket.connect_timeout(&addr, CONNECT_TIMEOUT)?;
        // Short read timeouts; receive_line polls against its own deadline.
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        socket.set_write_timeout(Some(CONNECT_TIMEOUT))?;
        Ok(socket)
    }
}

impl Transport for BluetoothRfcommTransport {
    fn name(&self) -> String {
        format!("bt:{}", self.address)
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    #[cfg(target_os = "linux")]
    fn connect(&mut self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            let address = self.address.clone();
            let channel = self.channel;
            let socket =
                tokio::task::spawn_blocking(move || rfcomm::connect_blocking(&address, channel))
                    .await
                    .map_err(join_err)??;
            debug!(address = %self.address, channel = self.channel, "rfcomm connected");
            self.socket = Some(socket);
            Ok(())
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn connect(&mut self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            Err(HubError::TransportUnavailable(
                "bluetooth rfcomm sockets are only supported on linux".into(),
            ))
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.socket = None;
        })
    }

    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            let mut socket = self.socket.take().ok_or(HubError::NotConnected)?;
            let data = data.to_vec();
            let (socket, result) = tokio::task::spawn_blocking(move || {
                let result = socket
                    .write_all(&data)
                    .and_then(|()| socket.flush())
                    .map_err(HubError::Io);
                (socket, result)
            })
            .await
            .map_err(join_err)?;
            self.socket = Some(socket);
            result
        })
    }

    fn receive_line(&mut self, timeout: Duration) -> BoxFuture<'_, Result<String, HubError>> {
        Box::pin(async move {
            let mut socket = self.socket.take().ok_or(HubError::NotConnected)?;
            let (socket, result) = tokio::task::spawn_blocking(move || {
                let result = read_line_blocking(&mut socket, timeout);
                (socket, result)
            })
            .await
            .map_err(join_err)?;
            self.socket = Some(socket);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_round_trip_and_line_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"beep 880 200\n");
            stream.write_all(b"OK beep\nREADY\n").await.unwrap();
        });

        let mut transport = WifiTcpTransport::new("127.0.0.1".into(), port);
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        transport.send(b"beep 880 200\n").await.unwrap();
        let line = transport.receive_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "OK beep");
        // The second buffered line is delivered by the next read.
        let line = transport.receive_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "READY");
        transport.disconnect().await;
        assert!(!transport.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_slow_line_survives_a_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"REA").await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            stream.write_all(b"DY\n").await.unwrap();
        });

        let mut transport = WifiTcpTransport::new("127.0.0.1".into(), port);
        transport.connect().await.unwrap();
        let err = transport
            .receive_line(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout));
        // The bytes read before the timeout are not lost: the next call
        // completes the same line.
        let line = transport.receive_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "READY");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_receive_times_out_without_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut transport = WifiTcpTransport::new("127.0.0.1".into(), port);
        transport.connect().await.unwrap();
        let err = transport
            .receive_line(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout));
    }

    #[tokio::test]
    async fn disconnected_transport_errors() {
        let mut transport = WifiTcpTransport::new("127.0.0.1".into(), 1);
        let err = transport.send(b"x").await.unwrap_err();
        assert!(matches!(err, HubError::NotConnected));
    }
}
