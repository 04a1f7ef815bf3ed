//! Wake-on-LAN magic packets over UDP broadcast.
//!
//! Sending is fire-and-forget: success only means the datagram left the host.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use tokio::net::UdpSocket;

use crate::error::{EngineError, EngineResult};

pub const MAGIC_PACKET_LEN: usize = 102;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// All-zero addresses belong to virtual or absent interfaces.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl FromStr for MacAddress {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(EngineError::Rejected(format!("invalid MAC address '{s}'")));
        }
        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(EngineError::Rejected(format!("invalid MAC address '{s}'")));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| EngineError::Rejected(format!("invalid MAC address '{s}'")))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// 6 × 0xFF followed by 16 repetitions of the MAC.
pub fn magic_packet(mac: &MacAddress) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xFFu8; MAGIC_PACKET_LEN];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac.0);
    }
    packet
}

#[async_trait]
pub trait WakeSender: Send + Sync {
    /// Send one magic packet to `addr` (`host:port`).
    async fn send(&self, mac: &MacAddress, addr: &str) -> EngineResult<()>;

    /// Succeeds if at least one address accepted the packet; otherwise
    /// reports the last failure.
    async fn send_any(&self, mac: &MacAddress, addrs: &[String]) -> EngineResult<usize> {
        let mut accepted = 0;
        let mut last_error = None;
        for addr in addrs {
            match self.send(mac, addr).await {
                Ok(()) => accepted += 1,
                Err(e) => last_error = Some(e),
            }
        }
        match (accepted, last_error) {
            (0, Some(e)) => Err(e),
            (0, None) => Err(EngineError::Actuation("no broadcast addresses configured".into())),
            (n, _) => Ok(n),
        }
    }
}

pub struct UdpWakeSender;

#[async_trait]
impl WakeSender for UdpWakeSender {
    async fn send(&self, mac: &MacAddress, addr: &str) -> EngineResult<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| EngineError::Connectivity(format!("binding UDP socket: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| EngineError::Connectivity(format!("enabling broadcast: {e}")))?;
        socket
            .send_to(&magic_packet(mac), addr)
            .await
            .map_err(|e| EngineError::Connectivity(format!("sending magic packet to {addr}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_layout() {
        let mac: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let packet = magic_packet(&mac);
        assert_eq!(packet.len(), 102);
        assert!(packet[..6].iter().all(|b| *b == 0xFF));
        for rep in packet[6..].chunks(6) {
            assert_eq!(rep, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        }
    }

    #[test]
    fn mac_parsing_accepts_both_separators() {
        let a: MacAddress = "aa-bb-cc-dd-ee-ff".parse().unwrap();
        let b: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "aa:bb:cc:dd:ee:ff");
        assert!("aa:bb:cc".parse::<MacAddress>().is_err());
        assert!("aa:bb:cc:dd:ee:gg".parse::<MacAddress>().is_err());
        assert!("aaa:bb:cc:dd:ee:f".parse::<MacAddress>().is_err());
        assert!("00:00:00:00:00:00".parse::<MacAddress>().unwrap().is_zero());
    }

    #[tokio::test]
    async fn packet_reaches_a_local_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mac: MacAddress = "01:02:03:04:05:06".parse().unwrap();

        let accepted = UdpWakeSender
            .send_any(&mac, &[addr])
            .await
            .unwrap();
        assert_eq!(accepted, 1);

        let mut buf = [0u8; 200];
        let (n, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &magic_packet(&mac)[..]);
    }

    struct FlakySender;

    #[async_trait]
    impl WakeSender for FlakySender {
        async fn send(&self, _mac: &MacAddress, addr: &str) -> EngineResult<()> {
            if addr.ends_with(":9") {
                Err(EngineError::Connectivity("unreachable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn any_accepting_address_is_success() {
        let mac: MacAddress = "01:02:03:04:05:06".parse().unwrap();
        let addrs = vec!["10.0.0.255:9".to_string(), "10.0.0.255:7".to_string()];
        assert_eq!(FlakySender.send_any(&mac, &addrs).await.unwrap(), 1);
        assert!(FlakySender
            .send_any(&mac, &addrs[..1])
            .await
            .is_err());
    }
}
