use clap::Parser;
use ros_sensor_link::loopback::loopback;
use ros_sensor_link::{
    ConnectionState, Connector, MeshMap, SensorConfig, SensorConnection, WebSocketConnector,
};
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Connects to a ROS bridge mesh sensor and reports the decoded mesh"
)]
struct Args {
    /// ROS bridge host
    #[arg(long)]
    host: Option<String>,

    /// ROS bridge port
    #[arg(short, long)]
    port: Option<u16>,

    /// Subscriber alias to enable (repeatable)
    #[arg(short, long = "subscriber", value_name = "ALIAS")]
    subscribers: Vec<String>,

    /// Sensor settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay captured bridge frames (one JSON frame per line) instead of connecting
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Interval between pumps in milliseconds
    #[arg(long, default_value = "16")]
    tick_ms: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    let mut config = match &args.config {
        Some(path) => SensorConfig::load(path)?,
        None => SensorConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if !args.subscribers.is_empty() {
        config.subscribers = args.subscribers.clone();
    }

    match &args.replay {
        Some(path) => {
            let capture = fs::read_to_string(path)?;
            let (connector, handle) = loopback();
            let mut sensor = SensorConnection::with_config(connector, &config);
            start(&mut sensor, &config)?;

            let mut frames = 0;
            for line in capture.lines().filter(|line| !line.trim().is_empty()) {
                handle.push_text(line);
                frames += 1;
            }
            handle.close_from_remote(Some("end of replay"));
            info!("Replaying {} frames from {:?}", frames, path);

            monitor(&mut sensor, &args);
        }
        None => {
            let connector = WebSocketConnector::new(config.transport_config());
            let mut sensor = SensorConnection::with_config(connector, &config);
            start(&mut sensor, &config)?;
            monitor(&mut sensor, &args);
        }
    }

    Ok(())
}

fn start<C: Connector>(
    sensor: &mut SensorConnection<C>,
    config: &SensorConfig,
) -> ros_sensor_link::Result<()> {
    let report = sensor.initialize(
        &config.unique_id,
        &config.host,
        config.port,
        config.subscribers.as_slice(),
    )?;
    for alias in &report.unknown_aliases {
        warn!("Ignoring unknown subscriber alias {}", alias);
    }
    info!("Monitoring {} on {:?}", sensor.sensor_name(), report.topics);
    Ok(())
}

fn monitor<C: Connector>(sensor: &mut SensorConnection<C>, args: &Args) {
    let tick = Duration::from_millis(args.tick_ms.max(1));
    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let mut map = MeshMap::new();
    let mut last_report = Instant::now();

    loop {
        sensor.pump_events();
        let applied = sensor.drain_into(&mut map);

        let connected = sensor.state() == ConnectionState::Connected;
        let idle = applied == 0 && sensor.stats().pending() == 0;
        if !connected && idle {
            info!("Bridge session ended ({:?})", sensor.state());
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("Monitoring time elapsed");
            break;
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            report(sensor, &map);
            last_report = Instant::now();
        }
        thread::sleep(tick);
    }

    sensor.shutdown();
    report(sensor, &map);
}

fn report<C: Connector>(sensor: &SensorConnection<C>, map: &MeshMap) {
    let stats = sensor.stats();
    info!(
        "{} blocks, {} vertices, {} triangles | {} decoded, {} failed, {} dropped, {} blocks rejected",
        map.block_count(),
        map.vertex_count(),
        map.triangle_count(),
        stats.messages_decoded,
        stats.messages_failed,
        stats.messages_dropped,
        stats.blocks_rejected
    );
}
