//! Hosted broker uplink over TCP.
//!
//! Messages are newline-delimited JSON in both directions:
//!
//! ```text
//! gateway -> broker  {"subscribe":"project_cmd/central_hub_01"}
//! gateway -> broker  {"topic":"project_data/central_hub_01","qos":1,"payload":{...}}
//! broker  -> gateway {"topic":"project_cmd/central_hub_01","payload":{"command":"publish_now"}}
//! ```
//!
//! [`tcp_uplink`] returns the two halves the gateway needs: a
//! [`Connectivity`] driver that opens one session per `connect()` and reports
//! the outcome as `LinkUp` / `LinkDown` on the bus, and a [`Transport`] that
//! queues envelopes onto the live session. Link reports wait for room on a
//! full bus rather than being dropped.

use crate::bus::{Event, EventSender};
use crate::config::UplinkConfig;
use crate::error::{LinkError, TransportError};
use crate::link::Connectivity;
use crate::publisher::{build_topic, PublishEnvelope, Topic, Transport};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Serialize)]
struct SubscribeLine<'a> {
    subscribe: &'a str,
}

#[derive(Debug, Serialize)]
struct PublishLine<'a> {
    topic: &'a str,
    qos: u8,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InboundLine {
    topic: String,
    payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<PublishEnvelope>>>,
}

impl Shared {
    fn set_outbound(&self, outbound: Option<mpsc::Sender<PublishEnvelope>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = outbound;
    }

    fn outbound(&self) -> Option<mpsc::Sender<PublishEnvelope>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone)]
struct SessionConfig {
    broker_addr: String,
    command_topic: Topic,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    queue: usize,
}

/// Build the connectivity driver and transport for one broker connection.
pub fn tcp_uplink(
    config: &UplinkConfig,
    device_id: &str,
    reconnect_delay: Duration,
    bus: EventSender,
) -> Result<(UplinkConnectivity, UplinkTransport), LinkError> {
    let command_topic = build_topic(&config.command_topic_prefix, device_id).ok_or_else(|| {
        LinkError::DriverUnavailable(format!("command topic for {} too long", device_id))
    })?;

    let shared = Arc::new(Shared::default());
    let session = SessionConfig {
        broker_addr: config.broker_addr.clone(),
        command_topic,
        connect_timeout: config.connect_timeout(),
        reconnect_delay,
        queue: config.outbound_queue,
    };

    let connectivity = UplinkConnectivity {
        session,
        bus,
        shared: Arc::clone(&shared),
        task: None,
    };
    Ok((connectivity, UplinkTransport { shared }))
}

pub struct UplinkConnectivity {
    session: SessionConfig,
    bus: EventSender,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl UplinkConnectivity {
    pub fn command_topic(&self) -> &str {
        self.session.command_topic.as_str()
    }

    pub fn is_session_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn stop_session(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.set_outbound(None);
    }
}

impl Connectivity for UplinkConnectivity {
    fn connect(&mut self) -> Result<(), LinkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LinkError::DriverUnavailable(e.to_string()))?;

        self.stop_session();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.session.queue);
        self.shared.set_outbound(Some(outbound_tx));

        let session = self.session.clone();
        let bus = self.bus.clone();
        let shared = Arc::clone(&self.shared);
        self.task = Some(runtime.spawn(async move {
            run_session(session, bus, shared, outbound_rx).await;
        }));
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.task.is_some() {
            info!("Closing broker session to {}", self.session.broker_addr);
        }
        self.stop_session();
    }
}

impl Drop for UplinkConnectivity {
    fn drop(&mut self) {
        self.stop_session();
    }
}

/// Publishing half; cheap to clone.
#[derive(Debug, Clone)]
pub struct UplinkTransport {
    shared: Arc<Shared>,
}

impl Transport for UplinkTransport {
    fn publish(&mut self, envelope: PublishEnvelope) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let outbound = self.shared.outbound().ok_or(TransportError::NotConnected)?;

        outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected,
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

async fn run_session(
    session: SessionConfig,
    bus: EventSender,
    shared: Arc<Shared>,
    outbound_rx: mpsc::Receiver<PublishEnvelope>,
) {
    match serve_broker(&session, &bus, &shared, outbound_rx).await {
        Ok(()) => info!("Broker {} closed the session", session.broker_addr),
        Err(e) => warn!("Broker session to {} ended: {}", session.broker_addr, e),
    }

    shared.connected.store(false, Ordering::SeqCst);
    tokio::time::sleep(session.reconnect_delay).await;
    if let Err(e) = bus.deliver(Event::LinkDown).await {
        error!("Could not report link down: {}", e);
    }
}

async fn serve_broker(
    session: &SessionConfig,
    bus: &EventSender,
    shared: &Shared,
    mut outbound_rx: mpsc::Receiver<PublishEnvelope>,
) -> std::io::Result<()> {
    let stream = tokio::time::timeout(
        session.connect_timeout,
        TcpStream::connect(session.broker_addr.as_str()),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "broker connect timed out"))??;

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let subscribe = SubscribeLine {
        subscribe: session.command_topic.as_str(),
    };
    write_line(&mut writer, &subscribe).await?;

    shared.connected.store(true, Ordering::SeqCst);
    info!("Connected to broker {}", session.broker_addr);
    if let Err(e) = bus.deliver(Event::LinkUp).await {
        error!("Could not report link up: {}", e);
    }

    loop {
        tokio::select! {
            envelope = outbound_rx.recv() => {
                let Some(envelope) = envelope else {
                    return Ok(());
                };
                let line = PublishLine {
                    topic: envelope.topic.as_str(),
                    qos: envelope.delivery.qos(),
                    payload: payload_value(&envelope.payload),
                };
                write_line(&mut writer, &line).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                handle_inbound(&session.command_topic, bus, &line);
            }
        }
    }
}

async fn write_line<W, M>(writer: &mut W, message: &M) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await
}

fn payload_value(payload: &[u8]) -> serde_json::Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()))
}

fn handle_inbound(command_topic: &Topic, bus: &EventSender, line: &str) {
    let inbound: InboundLine = match serde_json::from_str(line) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!("Ignoring malformed broker line: {}", e);
            return;
        }
    };

    if inbound.topic != command_topic.as_str() {
        debug!("Ignoring message on {}", inbound.topic);
        return;
    }

    let bytes = match inbound.payload {
        serde_json::Value::String(text) => text.into_bytes(),
        other => other.to_string().into_bytes(),
    };
    if let Err(e) = bus.try_post(Event::CommandReceived(bytes)) {
        warn!("Dropping inbound command: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus;
    use crate::config::BusConfig;
    use crate::publisher::DeliveryLevel;
    use tokio::net::TcpListener;

    async fn next_event(rx: &mut bus::EventReceiver) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.next())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = UplinkConfig {
            broker_addr: listener.local_addr().unwrap().to_string(),
            ..UplinkConfig::default()
        };
        let (tx, mut rx) = bus::channel(&BusConfig::default());
        let (mut connectivity, mut transport) =
            tcp_uplink(&config, "hub", Duration::from_millis(10), tx).unwrap();

        assert!(matches!(
            transport.publish(PublishEnvelope {
                topic: build_topic("project_data/", "hub").unwrap(),
                payload: b"{}".to_vec(),
                delivery: DeliveryLevel::AtLeastOnce,
            }),
            Err(TransportError::NotConnected)
        ));

        connectivity.connect().unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let subscribe = lines.next_line().await.unwrap().unwrap();
        assert_eq!(subscribe, r#"{"subscribe":"project_cmd/hub"}"#);
        assert_eq!(next_event(&mut rx).await, Event::LinkUp);
        assert!(transport.is_connected());

        transport
            .publish(PublishEnvelope {
                topic: build_topic("project_data/", "hub").unwrap(),
                payload: br#"{"co2":{"value":600,"timestamp":1}}"#.to_vec(),
                delivery: DeliveryLevel::AtLeastOnce,
            })
            .unwrap();
        let published: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(published["topic"], "project_data/hub");
        assert_eq!(published["qos"], 1);
        assert_eq!(published["payload"]["co2"]["value"], 600);

        writer
            .write_all(b"{\"topic\":\"project_cmd/hub\",\"payload\":{\"command\":\"publish_now\"}}\n")
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            Event::CommandReceived(br#"{"command":"publish_now"}"#.to_vec())
        );

        drop(writer);
        drop(lines);
        assert_eq!(next_event(&mut rx).await, Event::LinkDown);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_link_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = UplinkConfig {
            broker_addr: addr,
            ..UplinkConfig::default()
        };
        let (tx, mut rx) = bus::channel(&BusConfig::default());
        let (mut connectivity, _transport) =
            tcp_uplink(&config, "hub", Duration::from_millis(10), tx).unwrap();

        connectivity.connect().unwrap();
        assert_eq!(next_event(&mut rx).await, Event::LinkDown);
    }

    #[tokio::test]
    async fn test_link_down_survives_a_full_bus() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = UplinkConfig {
            broker_addr: addr,
            ..UplinkConfig::default()
        };
        let (tx, mut rx) = bus::channel(&BusConfig {
            capacity: 1,
            enqueue_timeout_ms: 10,
        });
        tx.try_post(Event::PublishTick).unwrap();
        let (mut connectivity, _transport) =
            tcp_uplink(&config, "hub", Duration::from_millis(10), tx.clone()).unwrap();

        connectivity.connect().unwrap();
        // Well past the enqueue timeout; the report must still be waiting.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(connectivity.is_session_active());

        assert_eq!(next_event(&mut rx).await, Event::PublishTick);
        assert_eq!(next_event(&mut rx).await, Event::LinkDown);
        assert_eq!(tx.stats().dropped, 0);
    }

    #[test]
    fn test_connect_outside_runtime_is_refused() {
        let (tx, _rx) = bus::channel(&BusConfig::default());
        let (mut connectivity, _transport) =
            tcp_uplink(&UplinkConfig::default(), "hub", Duration::ZERO, tx).unwrap();
        assert!(connectivity.connect().is_err());
    }
}
