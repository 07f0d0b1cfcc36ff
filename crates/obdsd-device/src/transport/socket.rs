//! Socket transport
//!
//! All three transport kinds end up as a TCP socket carrying link frames
//! with a two-byte big-endian length prefix:
//! - WiFi connects straight to the adapter's own access point
//! - Bluetooth connects to an RFCOMM-to-socket bridge on the local host
//! - Cellular connects to a relay, which forwards to the device named in
//!   a `RELAY <serial>` preamble frame

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obdsd_core::TransportKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::config::{DeviceConfig, EndpointConfig};
use crate::transport::{mock, Transport, TransportError, TransportFactory};

const RELAY_PREAMBLE: &[u8] = b"RELAY ";
const RELAY_ACCEPTED: &[u8] = b"OK";

pub struct SocketTransport {
    kind: TransportKind,
    url: String,
    addr: String,
    relay_serial: Option<String>,
    connect_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
}

impl SocketTransport {
    /// Open a socket transport. `relay_serial` is set for cellular endpoints
    /// and routes the relay to the right device.
    pub async fn connect(
        kind: TransportKind,
        url: &str,
        relay_serial: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let addr = socket_addr(url)?;
        let transport = Self {
            kind,
            url: url.to_string(),
            addr,
            relay_serial,
            connect_timeout,
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
        };
        let stream = transport.open_stream().await?;
        *transport.stream.lock().await = Some(stream);
        transport.connected.store(true, Ordering::SeqCst);
        info!(kind = %kind, url, "Socket transport open");
        Ok(transport)
    }

    async fn open_stream(&self) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout("Connect timeout".to_string()))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let mut stream = stream;
        if let Some(serial) = &self.relay_serial {
            let mut preamble = RELAY_PREAMBLE.to_vec();
            preamble.extend_from_slice(serial.as_bytes());
            write_frame(&mut stream, &preamble).await?;
            let answer = read_frame(&mut stream).await?;
            if answer != RELAY_ACCEPTED {
                return Err(TransportError::ConnectionFailed(format!(
                    "relay refused device {serial}"
                )));
            }
            debug!(serial, "Relay accepted");
        }
        Ok(stream)
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn exchange(&self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

        let result = tokio::time::timeout(timeout, async {
            write_frame(stream, frame).await?;
            read_frame(stream).await
        })
        .await;

        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                // Any I/O failure invalidates the stream; half-written
                // frames would desynchronize the length prefix.
                *guard = None;
                self.mark_closed();
                Err(e)
            }
            Err(_) => {
                *guard = None;
                self.mark_closed();
                Err(TransportError::Timeout("Exchange timeout".to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.mark_closed();
        let stream = self.open_stream().await?;
        *self.stream.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        info!(kind = %self.kind, url = %self.url, "Socket transport reopened");
        Ok(())
    }

    async fn shutdown(&self) {
        self.mark_closed();
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<(), TransportError> {
    let len = u16::try_from(frame.len())
        .map_err(|_| TransportError::SendFailed(format!("frame of {} bytes", frame.len())))?;
    let map = |e| map_io_err(e, true);
    stream.write_all(&len.to_be_bytes()).await.map_err(map)?;
    stream.write_all(frame).await.map_err(map)?;
    stream.flush().await.map_err(map)?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let map = |e| map_io_err(e, false);
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.map_err(map)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await.map_err(map)?;
    Ok(frame)
}

fn map_io_err(e: io::Error, sending: bool) -> TransportError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => TransportError::ConnectionClosed,
        _ if sending => TransportError::SendFailed(e.to_string()),
        _ => TransportError::ReceiveFailed(e.to_string()),
    }
}

fn socket_addr(raw: &str) -> Result<String, TransportError> {
    let url = Url::parse(raw).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
    if url.scheme() != "tcp" {
        return Err(TransportError::InvalidEndpoint(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidEndpoint("missing host".to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| TransportError::InvalidEndpoint("missing port".to_string()))?;
    Ok(format!("{host}:{port}"))
}

/// Default factory: real sockets for network endpoints, a fresh simulated
/// vehicle for `mock` endpoints so demo configurations need no hardware.
pub struct SocketTransportFactory;

#[async_trait]
impl TransportFactory for SocketTransportFactory {
    async fn create(
        &self,
        endpoint: &EndpointConfig,
        config: &DeviceConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let connect_timeout = config.timings.command_timeout();
        match endpoint {
            EndpointConfig::Wifi { url } => Ok(Arc::new(
                SocketTransport::connect(TransportKind::Wifi, url, None, connect_timeout).await?,
            )),
            EndpointConfig::Bluetooth { url } => Ok(Arc::new(
                SocketTransport::connect(TransportKind::Bluetooth, url, None, connect_timeout)
                    .await?,
            )),
            EndpointConfig::Cellular { url } => Ok(Arc::new(
                SocketTransport::connect(
                    TransportKind::Cellular,
                    url,
                    Some(config.device.serial.clone()),
                    connect_timeout,
                )
                .await?,
            )),
            EndpointConfig::Mock { kind, latency_ms } => {
                let vehicle = Arc::new(
                    mock::MockVehicle::new(&config.device.serial, config.auth.secret.as_bytes())
                        .with_standard_sensors(),
                );
                Ok(Arc::new(mock::MockTransport::new(
                    vehicle,
                    *kind,
                    Duration::from_millis(*latency_ms),
                )))
            }
        }
    }
}
