use clap::{App, Arg};
use colored::*;
use habtracker::hal::{Fix, GpsTime};
use habtracker::payload::{Hardware, Payload};
use habtracker::settings::PayloadSettings;
use habtracker::sim::{ChunkCodec, GpsControl, RadioControl, SimAlert, SimCamera, SimGps, SimRadio, SimTemperature, SimVoltage};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, sleep, Instant};
use tracing::{error, info, warn, Level};

const DEFAULT_PORT: &str = "8080";
const REBOOT_DELAY: Duration = Duration::from_secs(1);
const BRIDGE_POLL: Duration = Duration::from_millis(10);
const IDLE_DRAIN: Duration = Duration::from_millis(100);

// Simulated flight: launch site and a steady ascent
const LAUNCH_LAT: f64 = 39.9042;
const LAUNCH_LON: f64 = 116.4074;
const LAUNCH_ALT_M: f64 = 45.0;
const ASCENT_RATE_MPS: f64 = 5.0;
const GROUND_SPEED_KMH: f64 = 18.5;
const HEADING_DEG: f64 = 72.0;
// About 3.6 V at the supply through the 10k/1k divider
const SUPPLY_RAW: u32 = 430;
const BOARD_TEMP_C: f32 = 24.5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("habtracker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🎈 High-altitude balloon payload on simulated hardware")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON settings file; absent fields keep flight defaults")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port the ground station connects to")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .help("Developer mode: skip positioning init and blank position fields"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log at debug level"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut settings = match matches.value_of("config") {
        Some(path) => PayloadSettings::load(path)?,
        None => PayloadSettings::default(),
    };
    if matches.is_present("debug") {
        settings.debug_mode = true;
    }
    settings.validate()?;
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;

    println!("{}", "🎈 habtracker - balloon payload flight software".bright_blue().bold());
    println!(
        "{} callsign {}, ground link on port {}{}",
        "📡".bright_blue(),
        settings.callsign.bright_white().bold(),
        port.to_string().bright_cyan(),
        if settings.debug_mode {
            " (developer mode)".yellow().to_string()
        } else {
            String::new()
        }
    );

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let (_, radio) = SimRadio::new();
    let (_, gps) = SimGps::new();
    tokio::spawn(serve_ground(listener, radio.clone()));
    tokio::spawn(simulate_flight(gps.clone()));

    let mut boots: u32 = 0;
    loop {
        boots += 1;
        info!(boot = boots, "powering up payload");

        let (camera, _) = SimCamera::new();
        let (alert, _) = SimAlert::new();
        let hardware = Hardware {
            radio: Box::new(radio.attach()),
            camera: Box::new(camera),
            codec: Box::new(ChunkCodec::new()),
            gps: Box::new(gps.attach()),
            voltage: Box::new(SimVoltage::new(SUPPLY_RAW)),
            temperature: Box::new(SimTemperature::new(BOARD_TEMP_C)),
            alert: Box::new(alert),
        };

        match Payload::new(settings.clone()).run(hardware).await {
            Ok(reason) => {
                println!("{} {}", "🔄".yellow(), format!("Restarting: {}", reason).yellow());
                warn!("payload restart: {}", reason);
            }
            Err(e) => {
                error!("payload stopped: {}", e);
                return Err(e.into());
            }
        }
        sleep(REBOOT_DELAY).await;
    }
}

/// Bridge the simulated radio to one TCP ground station at a time.
async fn serve_ground(listener: TcpListener, radio: RadioControl) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = sleep(IDLE_DRAIN) => {
                // Nobody listening; the downlink goes nowhere.
                radio.take_written();
                continue;
            }
        };

        info!("🔗 Ground station connected: {}", peer);
        if let Err(e) = bridge(stream, &radio).await {
            warn!("Ground station {} error: {}", peer, e);
        }
        info!("🔌 Ground station {} disconnected", peer);
    }
}

async fn bridge(mut stream: TcpStream, radio: &RadioControl) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.split();
    let mut buf = [0u8; 512];
    let mut ticker = interval(BRIDGE_POLL);
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                radio.inject(&buf[..n]);
            }
            _ = ticker.tick() => {
                for packet in radio.take_written() {
                    writer.write_all(&packet).await?;
                }
            }
        }
    }
}

/// Publish a fix every second along a steady ascent.
async fn simulate_flight(gps: GpsControl) {
    let launch = Instant::now();
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let elapsed = launch.elapsed().as_secs_f64();
        gps.publish(Fix {
            time: utc_now(),
            latitude: LAUNCH_LAT + elapsed * 1e-5,
            longitude: LAUNCH_LON + elapsed * 4e-5,
            altitude_m: LAUNCH_ALT_M + elapsed * ASCENT_RATE_MPS,
            speed_kmh: GROUND_SPEED_KMH,
            satellites: 9,
            heading_deg: HEADING_DEG,
            location_valid: true,
        });
    }
}

fn utc_now() -> GpsTime {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = (secs / 86_400) as i64;
    let of_day = secs % 86_400;

    // Civil date from days since 1970-01-01 (proleptic Gregorian).
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    GpsTime {
        year: year as u16,
        month: month as u8,
        day: day as u8,
        hour: (of_day / 3600) as u8,
        minute: (of_day / 60 % 60) as u8,
        second: (of_day % 60) as u8,
    }
}
