//! Device discovery over UDP broadcast
//!
//! WiFi adapters on the local network answer a probe datagram with an
//! announcement of the form `OBDSD <serial> <model> <port>`. The announced
//! port is the TCP port the adapter accepts link frames on.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::transport::TransportError;

/// Probe payload adapters answer to
pub const PROBE: &[u8] = b"OBDSD?";
/// UDP port adapters listen for probes on
pub const DISCOVERY_PORT: u16 = 35035;

/// Adapter that answered a discovery probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub serial: String,
    pub model: String,
    pub ip: String,
    pub port: u16,
}

impl DiscoveredDevice {
    /// WiFi endpoint URL for this announcement
    pub fn url(&self) -> String {
        format!("tcp://{}:{}", self.ip, self.port)
    }
}

fn parse_announcement(data: &[u8], addr: SocketAddr) -> Option<DiscoveredDevice> {
    let text = std::str::from_utf8(data).ok()?;
    let mut parts = text.split_whitespace();
    if parts.next()? != "OBDSD" {
        return None;
    }
    let serial = parts.next()?.to_string();
    let model = parts.next()?.to_string();
    let port = parts.next()?.parse().ok()?;
    Some(DiscoveredDevice {
        serial,
        model,
        ip: addr.ip().to_string(),
        port,
    })
}

/// Discover adapters via UDP broadcast. Collects announcements until the
/// timeout elapses; duplicates from multi-homed adapters are dropped.
pub async fn discover_devices(timeout_ms: u64) -> Result<Vec<DiscoveredDevice>, TransportError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let broadcast: SocketAddr = ([255, 255, 255, 255], DISCOVERY_PORT).into();
    socket
        .send_to(PROBE, broadcast)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

    info!("Sent discovery probe");

    let mut devices: Vec<DiscoveredDevice> = Vec::new();
    let mut buf = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                if let Some(device) = parse_announcement(&buf[..len], addr) {
                    debug!(serial = %device.serial, ip = %device.ip, "Device announced");
                    if !devices.iter().any(|d| d.serial == device.serial) {
                        devices.push(device);
                    }
                }
            }
            _ => break,
        }
    }

    info!(count = devices.len(), "Discovery complete");
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_announcement() {
        let addr: SocketAddr = "192.168.0.10:35035".parse().unwrap();
        let device = parse_announcement(b"OBDSD OBD-7F3A falcon-pro 35000", addr).unwrap();
        assert_eq!(device.serial, "OBD-7F3A");
        assert_eq!(device.model, "falcon-pro");
        assert_eq!(device.url(), "tcp://192.168.0.10:35000");
    }

    #[test]
    fn test_parse_rejects_foreign_traffic() {
        let addr: SocketAddr = "192.168.0.10:35035".parse().unwrap();
        assert_eq!(parse_announcement(b"SSDP hello", addr), None);
        assert_eq!(parse_announcement(b"OBDSD incomplete", addr), None);
        assert_eq!(parse_announcement(b"OBDSD X Y notaport", addr), None);
        assert_eq!(parse_announcement(&[0xFF, 0xFE], addr), None);
    }

    #[tokio::test]
    async fn test_probe_and_announce_loopback() {
        // Stand-in adapter on an ephemeral port
        let adapter = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let adapter_addr = adapter.local_addr().unwrap();

        let prober = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        prober.send_to(PROBE, adapter_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = adapter.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], PROBE);
        adapter
            .send_to(b"OBDSD OBD-1 mk1 35000", from)
            .await
            .unwrap();

        let (len, from) = prober.recv_from(&mut buf).await.unwrap();
        let device = parse_announcement(&buf[..len], from).unwrap();
        assert_eq!(device.serial, "OBD-1");
        assert_eq!(device.port, 35000);
    }
}
