use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use sensorhub::ingress::to_datagram;
use sensorhub::radio::{encode, MacAddress, SensorReading};
use std::time::Duration;
use tokio::net::UdpSocket;

const DEFAULT_GATEWAY: &str = "127.0.0.1:5555";
const DEFAULT_MAC: &str = "24:6f:28:00:00:01";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("sensorhub-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("📡 Sensor node emulator - sends radio frames to a gateway's UDP bridge")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("gateway")
                .short("g")
                .long("gateway")
                .value_name("ADDR")
                .help("Gateway radio bridge address")
                .takes_value(true)
                .default_value(DEFAULT_GATEWAY)
                .global(true),
        )
        .arg(
            Arg::with_name("mac")
                .short("m")
                .long("mac")
                .value_name("MAC")
                .help("Sender radio address")
                .takes_value(true)
                .default_value(DEFAULT_MAC)
                .global(true)
                .validator(|v| {
                    v.parse::<MacAddress>()
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }),
        )
        .arg(
            Arg::with_name("count")
                .short("n")
                .long("count")
                .value_name("N")
                .help("Number of frames to send")
                .takes_value(true)
                .default_value("1")
                .global(true)
                .validator(is_number::<u32>),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .value_name("MS")
                .help("Delay between frames in milliseconds")
                .takes_value(true)
                .default_value("1000")
                .global(true)
                .validator(is_number::<u64>),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Print the raw frame bytes")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("temp")
                .about("🌡️  Temperature and humidity reading")
                .arg(value_arg("celsius", "Temperature in °C"))
                .arg(value_arg("humidity", "Relative humidity in %")),
        )
        .subcommand(
            SubCommand::with_name("lux")
                .about("💡 Illuminance reading")
                .arg(value_arg("lux", "Illuminance in lux")),
        )
        .subcommand(
            SubCommand::with_name("pressure")
                .about("🌀 Barometric pressure reading")
                .arg(value_arg("hpa", "Pressure in hPa")),
        )
        .subcommand(
            SubCommand::with_name("vitals")
                .about("❤️  Heart rate and SpO2 reading")
                .arg(value_arg("bpm", "Heart rate in beats per minute"))
                .arg(value_arg("spo2", "Blood oxygen saturation in %")),
        )
        .subcommand(
            SubCommand::with_name("co2")
                .about("🏭 CO2 concentration reading")
                .arg(value_arg("ppm", "CO2 in ppm")),
        )
        .subcommand(
            SubCommand::with_name("breathing")
                .about("🫁 Breathing rate reading")
                .arg(value_arg("rate", "Breaths per minute")),
        )
        .get_matches();

    let (kind, sub) = matches.subcommand();
    let sub = sub.ok_or("missing subcommand")?;
    let reading = match kind {
        "temp" => SensorReading::TemperatureHumidity {
            temperature: value(sub, "celsius")?,
            humidity: value(sub, "humidity")?,
        },
        "lux" => SensorReading::Illuminance {
            lux: value(sub, "lux")?,
        },
        "pressure" => SensorReading::Pressure {
            hpa: value(sub, "hpa")?,
        },
        "vitals" => SensorReading::Vitals {
            heart_rate: value(sub, "bpm")?,
            spo2: value(sub, "spo2")?,
        },
        "co2" => SensorReading::Co2 {
            ppm: value(sub, "ppm")?,
        },
        "breathing" => SensorReading::Breathing {
            rate: value(sub, "rate")?,
        },
        other => return Err(format!("unknown sensor kind {}", other).into()),
    };

    let gateway = sub.value_of("gateway").unwrap_or(DEFAULT_GATEWAY);
    let mac: MacAddress = sub.value_of("mac").unwrap_or(DEFAULT_MAC).parse()?;
    let count: u32 = sub.value_of("count").unwrap_or("1").parse()?;
    let interval = Duration::from_millis(sub.value_of("interval").unwrap_or("1000").parse()?);
    let verbose = sub.is_present("verbose");

    send_frames(gateway, mac, &reading, count, interval, verbose).await
}

async fn send_frames(
    gateway: &str,
    mac: MacAddress,
    reading: &SensorReading,
    count: u32,
    interval: Duration,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(gateway).await?;

    let frame = encode(reading);
    let datagram = to_datagram(mac, &frame);

    println!(
        "{} {} {} {}",
        "Sending".dimmed(),
        format!("{:?}", reading.kind()).bright_cyan(),
        "as".dimmed(),
        mac.to_string().bright_blue()
    );
    if verbose {
        let hex: Vec<String> = frame.iter().map(|b| format!("{b:02x}")).collect();
        println!("{} {}", "Frame:".dimmed(), hex.join(" "));
    }

    for sent in 1..=count {
        match socket.send(&datagram).await {
            Ok(_) => println!(
                "{} {} {}",
                "✅".green(),
                format!("[{}/{}]", sent, count).bold(),
                serde_json::to_string(reading)?.bright_green()
            ),
            Err(e) => {
                println!("{} {}", "❌".red(), format!("Send failed: {}", e).bright_red());
                return Err(e.into());
            }
        }

        if sent < count {
            tokio::time::sleep(interval).await;
        }
    }

    Ok(())
}

fn value_arg<'a, 'b>(name: &'a str, help: &'b str) -> Arg<'a, 'b> {
    Arg::with_name(name)
        .help(help)
        .required(true)
        .allow_hyphen_values(true)
        .validator(is_number::<f32>)
}

fn value(matches: &ArgMatches<'_>, name: &str) -> Result<f32, Box<dyn std::error::Error>> {
    let raw = matches
        .value_of(name)
        .ok_or_else(|| format!("missing value for {}", name))?;
    Ok(raw.parse::<f32>()?)
}

fn is_number<T: std::str::FromStr>(v: String) -> Result<(), String> {
    v.parse::<T>()
        .map(|_| ())
        .map_err(|_| format!("'{}' is not a valid number", v))
}
