//! Minimal SNTPv4 client (RFC 4330 unicast mode).
//!
//! Only the server's transmit timestamp is used; round-trip correction is not
//! worth it for millisecond publish stamps.

use crate::error::SntpError;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub const NTP_PORT: u16 = 123;
pub const PACKET_SIZE: usize = 48;
/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01.
pub const NTP_UNIX_OFFSET_S: u64 = 2_208_988_800;

const LI_ALARM: u8 = 0b11;
const MODE_CLIENT: u8 = 3;
const MODE_SERVER: u8 = 4;
const VERSION: u8 = 4;
const TRANSMIT_OFFSET: usize = 40;

pub fn build_request() -> [u8; PACKET_SIZE] {
    let mut packet = [0u8; PACKET_SIZE];
    packet[0] = (VERSION << 3) | MODE_CLIENT;
    packet
}

/// Extract the server transmit time as Unix milliseconds.
pub fn parse_response(packet: &[u8]) -> Result<u64, SntpError> {
    if packet.len() < PACKET_SIZE {
        return Err(SntpError::ShortResponse(packet.len()));
    }

    let leap = packet[0] >> 6;
    let mode = packet[0] & 0b111;
    let stratum = packet[1];
    if leap == LI_ALARM || stratum == 0 || mode != MODE_SERVER {
        return Err(SntpError::Unsynchronized);
    }

    let word = |offset: usize| {
        u32::from_be_bytes([
            packet[offset],
            packet[offset + 1],
            packet[offset + 2],
            packet[offset + 3],
        ])
    };
    let seconds = u64::from(word(TRANSMIT_OFFSET));
    let fraction = u64::from(word(TRANSMIT_OFFSET + 4));

    let unix_seconds = seconds
        .checked_sub(NTP_UNIX_OFFSET_S)
        .ok_or(SntpError::Unsynchronized)?;
    let millis = (fraction * 1000) >> 32;

    Ok(unix_seconds * 1000 + millis)
}

#[derive(Debug, Clone)]
pub struct SntpClient {
    servers: Vec<String>,
    timeout: Duration,
}

impl SntpClient {
    pub fn new(servers: Vec<String>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    pub async fn query_server(&self, server: &str) -> Result<u64, SntpError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((server, NTP_PORT)).await?;
        socket.send(&build_request()).await?;

        let mut buf = [0u8; 68];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| SntpError::Timeout)??;

        parse_response(&buf[..len])
    }

    /// Ask each server in order and return the first good answer.
    pub async fn query(&self) -> Result<u64, SntpError> {
        for server in &self.servers {
            match self.query_server(server).await {
                Ok(epoch_ms) => {
                    debug!("SNTP answer from {}: {} ms", server, epoch_ms);
                    return Ok(epoch_ms);
                }
                Err(e) => warn!("SNTP query to {} failed: {}", server, e),
            }
        }
        Err(SntpError::NoServerAnswered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_packet(seconds: u32, fraction: u32) -> [u8; PACKET_SIZE] {
        let mut packet = [0u8; PACKET_SIZE];
        packet[0] = (VERSION << 3) | MODE_SERVER;
        packet[1] = 2;
        packet[40..44].copy_from_slice(&seconds.to_be_bytes());
        packet[44..48].copy_from_slice(&fraction.to_be_bytes());
        packet
    }

    #[test]
    fn test_request_header() {
        let request = build_request();
        assert_eq!(request[0], 0x23);
        assert!(request[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_parse_transmit_timestamp() {
        // 2023-11-14T22:13:20Z, plus half a second.
        let seconds = (1_700_000_000 + NTP_UNIX_OFFSET_S) as u32;
        let packet = server_packet(seconds, 0x8000_0000);
        assert_eq!(parse_response(&packet).unwrap(), 1_700_000_000_500);
    }

    #[test]
    fn test_reject_unsynchronized_server() {
        let seconds = (1_700_000_000 + NTP_UNIX_OFFSET_S) as u32;
        let mut packet = server_packet(seconds, 0);
        packet[1] = 0;
        assert!(matches!(parse_response(&packet), Err(SntpError::Unsynchronized)));

        assert!(matches!(
            parse_response(&packet[..20]),
            Err(SntpError::ShortResponse(20))
        ));
    }
}
