use clap::{App, Arg};
use sensorhub::bus::{self, Event, EventSender};
use sensorhub::clock::system_epoch_ms;
use sensorhub::config::{GatewayConfig, TimeConfig};
use sensorhub::gateway::{Gateway, StatusHandle};
use sensorhub::ingress::RadioIngress;
use sensorhub::link::{reset_after_failure, LinkHandle, LinkState, WaitOutcome};
use sensorhub::sntp::SntpClient;
use sensorhub::uplink::tcp_uplink;
use std::path::Path;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SYNC_RETRY_DELAY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("sensorhub-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sensor hub gateway: radio frames in, timestamped JSON out")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (defaults to ./sensorhub.toml)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter, overrides [logging] level")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("broker")
                .short("b")
                .long("broker")
                .value_name("ADDR")
                .help("Broker address, overrides [uplink] broker_addr")
                .takes_value(true),
        )
        .get_matches();

    let mut config = GatewayConfig::load_or_default(matches.value_of("config").map(Path::new));
    if let Some(broker) = matches.value_of("broker") {
        config.uplink.broker_addr = broker.to_string();
    }
    let level = matches
        .value_of("log-level")
        .unwrap_or(&config.logging.level)
        .to_string();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)),
        )
        .init();

    info!("Sensor hub gateway {} starting", config.device.id);

    let (tx, rx) = bus::channel(&config.bus);
    let (connectivity, transport) = tcp_uplink(
        &config.uplink,
        &config.device.id,
        config.link.reconnect_delay(),
        tx.clone(),
    )?;
    let mut gateway = Gateway::new(&config, transport, connectivity, rx);

    let socket = UdpSocket::bind(config.uplink.radio_bind.as_str()).await?;
    let ingress = RadioIngress::new(tx.clone());
    let radio_task = tokio::spawn(async move {
        if let Err(e) = ingress.serve_udp(socket).await {
            error!("Radio bridge stopped: {}", e);
        }
    });

    let time_task = tokio::spawn(keep_time(
        config.time.clone(),
        gateway.link_handle(),
        config.link.wait_timeout(),
        tx.clone(),
    ));

    let tick_task = (config.publish.publish_interval_ms > 0).then(|| {
        tokio::spawn(publish_ticker(
            Duration::from_millis(config.publish.publish_interval_ms),
            tx.clone(),
        ))
    });

    let reset_delay = config.link.failed_reset_delay();
    let supervisor_task = match reset_delay {
        Some(backoff) => tokio::spawn(reset_after_failure(gateway.link_handle(), backoff, tx.clone())),
        None => tokio::spawn(stop_on_failure(gateway.link_handle(), tx.clone())),
    };

    let status_task = tokio::spawn(log_status(
        gateway.status_handle(),
        Duration::from_secs(config.logging.status_interval_s.max(1)),
    ));

    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received");
                if let Err(e) = shutdown_tx.post(Event::Shutdown).await {
                    error!("Could not request shutdown: {}", e);
                }
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    gateway.start();
    gateway.run().await;
    let link_failed = gateway.link_state() == LinkState::Failed;
    gateway.shutdown();

    radio_task.abort();
    time_task.abort();
    status_task.abort();
    supervisor_task.abort();
    if let Some(task) = tick_task {
        task.abort();
    }

    if link_failed && reset_delay.is_none() {
        return Err("uplink failed and automatic reset is disabled".into());
    }
    Ok(())
}

/// With automatic reset disabled, a failed link ends the process so the
/// service manager can restart it.
async fn stop_on_failure(mut link: LinkHandle, bus: EventSender) {
    if link.wait_for_state(LinkState::Failed).await {
        error!("Uplink failed; shutting down");
        if let Err(e) = bus.deliver(Event::Shutdown).await {
            error!("Could not request shutdown: {}", e);
        }
    }
}

/// Sync once the uplink is up, then re-sync on the configured interval. With
/// no servers configured the host clock is trusted instead.
async fn keep_time(config: TimeConfig, link: LinkHandle, wait_timeout: Duration, bus: EventSender) {
    let client = SntpClient::new(config.servers.clone(), config.query_timeout());
    let resync = config.resync_interval().max(Duration::from_secs(1));

    loop {
        match link.wait_until_connected(wait_timeout).await {
            WaitOutcome::Connected => {}
            WaitOutcome::Failed => warn!("Uplink failed; time sync deferred"),
            WaitOutcome::TimedOut => warn!("Uplink not connected after {:?}", wait_timeout),
        }

        let synced = if client.servers().is_empty() {
            system_epoch_ms()
        } else {
            match client.query().await {
                Ok(epoch_ms) => Some(epoch_ms),
                Err(e) => {
                    warn!("Time sync failed: {}", e);
                    None
                }
            }
        };

        let delay = match synced {
            Some(epoch_ms) => {
                if bus.post(Event::TimeSynced { epoch_ms }).await.is_err() && bus.is_closed() {
                    return;
                }
                resync
            }
            None => SYNC_RETRY_DELAY.min(resync),
        };
        time::sleep(delay).await;
    }
}

async fn publish_ticker(period: Duration, bus: EventSender) {
    let mut interval = time::interval(period);
    interval.tick().await;

    loop {
        interval.tick().await;
        // Drops are logged by the bus; the next tick covers them.
        let _ = bus.try_post(Event::PublishTick);
        if bus.is_closed() {
            return;
        }
    }
}

async fn log_status(status: StatusHandle, period: Duration) {
    let mut interval = time::interval(period);
    loop {
        interval.tick().await;
        info!("Gateway status: {}", status.to_json());
    }
}
