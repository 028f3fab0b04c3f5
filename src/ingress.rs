//! Radio receive path: decode each frame at the boundary and hand good
//! readings to the event bus. Malformed frames are logged and dropped here
//! and never reach the consumer loop.

use crate::bus::{Event, EventSender};
use crate::error::GatewayError;
use crate::radio::{decode, MacAddress, SensorReading, MAX_RADIO_PAYLOAD};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Hosted radio bridge datagrams are the 6-byte sender address followed by
/// the raw radio frame.
pub const ADDRESS_SIZE: usize = 6;
pub const MAX_DATAGRAM_SIZE: usize = ADDRESS_SIZE + MAX_RADIO_PAYLOAD;

pub fn to_datagram(source: MacAddress, frame: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(ADDRESS_SIZE + frame.len());
    datagram.extend_from_slice(&source.octets());
    datagram.extend_from_slice(frame);
    datagram
}

pub fn split_datagram(datagram: &[u8]) -> Option<(MacAddress, &[u8])> {
    if datagram.len() < ADDRESS_SIZE || datagram.len() > MAX_DATAGRAM_SIZE {
        return None;
    }
    let (address, frame) = datagram.split_at(ADDRESS_SIZE);
    Some((MacAddress::from_slice(address)?, frame))
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngressStats {
    pub received: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone)]
pub struct RadioIngress {
    bus: EventSender,
    counters: Arc<Counters>,
}

impl RadioIngress {
    pub fn new(bus: EventSender) -> Self {
        Self {
            bus,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Receive-callback entry point. Never waits on the bus.
    pub fn on_receive(&self, source: MacAddress, payload: &[u8]) -> Result<SensorReading, GatewayError> {
        let reading = self.decode_frame(source, payload)?;
        self.bus.try_post(Event::SensorDataReady { source, reading })?;
        Ok(reading)
    }

    /// Same as [`on_receive`](Self::on_receive) but allows the bus's short
    /// enqueue timeout.
    pub async fn on_receive_async(
        &self,
        source: MacAddress,
        payload: &[u8],
    ) -> Result<SensorReading, GatewayError> {
        let reading = self.decode_frame(source, payload)?;
        self.bus
            .post(Event::SensorDataReady { source, reading })
            .await?;
        Ok(reading)
    }

    pub fn stats(&self) -> IngressStats {
        IngressStats {
            received: self.counters.received.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Receive bridge datagrams on `socket` until it errors.
    pub async fn serve_udp(&self, socket: UdpSocket) -> std::io::Result<()> {
        info!("Radio bridge listening on {}", socket.local_addr()?);
        let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];

        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            let Some((source, frame)) = split_datagram(&buf[..len]) else {
                warn!("Malformed radio datagram from {} ({} bytes)", peer, len);
                continue;
            };
            // Rejections are logged inside; the listener keeps going.
            let _ = self.on_receive_async(source, frame).await;
        }
    }

    fn decode_frame(&self, source: MacAddress, payload: &[u8]) -> Result<SensorReading, GatewayError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        match decode(payload) {
            Ok(reading) => {
                debug!("Frame from {}: {:?}", source, reading);
                Ok(reading)
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Discarding frame from {} ({} bytes): {}", source, payload.len(), e);
                Err(e.into())
            }
        }
    }
}
