//! NeuroRelay daemon
//!
//! ```text
//! neuro-relay [-l] [HOST PORT]   broker (default)
//! neuro-relay -c HOST PORT       stream the local device to a broker
//! neuro-relay -m HOST PORT       watch every source and log throughput
//! ```

use clap::Parser;
use neuro_relay::config::RelayConfig;
use neuro_relay::core::types::ClientId;
use neuro_relay::devices::create_device;
use neuro_relay::error::{Error, Result};
use neuro_relay::{BrokerServer, SourceClient, SubscriberClient};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// How often the monitor prints throughput and looks for new sources
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "neuro-relay", version, about = "Real-time biosignal relay")]
struct Args {
    /// Run the broker (default)
    #[arg(short = 'l', long, conflicts_with_all = ["source", "monitor"])]
    listen: bool,

    /// Stream the local device to a remote broker
    #[arg(short = 'c', long = "source", conflicts_with = "monitor")]
    source: bool,

    /// Watch every source of a remote broker and log throughput
    #[arg(short = 'm', long)]
    monitor: bool,

    /// Host to bind or connect to
    host: Option<String>,

    /// TCP port
    port: Option<u16>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("neuro-relay: {}", e);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    log::info!("NeuroRelay v{} starting...", env!("CARGO_PKG_VERSION"));

    match run(&args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("neuro-relay: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<RelayConfig> {
    let mut config = RelayConfig::load(args.config.as_deref())?;
    if let Some(host) = &args.host {
        config.network.host = host.clone();
    }
    if let Some(port) = args.port {
        config.network.port = port;
    }
    Ok(config)
}

fn run(args: &Args, config: RelayConfig) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    spawn_signal_handler(Arc::clone(&running))?;

    if args.source {
        run_source(&config, &running)
    } else if args.monitor {
        run_monitor(&config, &running)
    } else {
        run_broker(&config, running)
    }
}

fn spawn_signal_handler(running: Arc<AtomicBool>) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                log::info!("Received signal {:?}, initiating shutdown...", sig);
                running.store(false, Ordering::Relaxed);
            }
        })?;
    Ok(())
}

fn run_broker(config: &RelayConfig, running: Arc<AtomicBool>) -> Result<()> {
    let device = if config.broker.local_device {
        create_device(&config.device)?
    } else {
        None
    };
    let server = BrokerServer::bind(config, device, running)?;
    server.run()
}

fn run_source(config: &RelayConfig, running: &AtomicBool) -> Result<()> {
    let mut device = create_device(&config.device)?
        .ok_or_else(|| Error::Config("source mode needs a device".to_string()))?;

    let address = config.network.address();
    let mut client = SourceClient::connect(address.as_str(), config)?;
    log::info!("Streaming to {}", address);
    client.send_header(device.header())?;

    let sent = client.stream(device.as_mut(), running)?;
    log::info!("Sent {} sample(s)", sent);
    client.close();
    Ok(())
}

fn run_monitor(config: &RelayConfig, running: &AtomicBool) -> Result<()> {
    let address = config.network.address();
    let client = SubscriberClient::connect(address.as_str(), config)?;
    log::info!("Monitoring {}", address);

    let mut counts: BTreeMap<ClientId, usize> = BTreeMap::new();
    let mut last_report = Instant::now();

    while running.load(Ordering::Relaxed) {
        for id in client.sources() {
            if let Some(info) = client.source_info(id)
                && !info.watched
            {
                match client.watch(id) {
                    Ok(()) => log::info!("Watching source #{}: {}", id, info.header),
                    Err(e) => log::warn!("Cannot watch source #{}: {}", id, e),
                }
            }
        }

        for id in client.sources() {
            match client.get_data(id, 0) {
                Ok(block) => *counts.entry(id).or_default() += block.len(),
                // Source left since the last refresh
                Err(Error::UnknownClient(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let elapsed = last_report.elapsed();
        if elapsed >= MONITOR_INTERVAL {
            for (id, count) in &counts {
                log::info!(
                    "Source #{}: {:.1} samples/s",
                    id,
                    *count as f64 / elapsed.as_secs_f64()
                );
            }
            counts.clear();
            last_report = Instant::now();

            let known = client.refresh_status()?;
            log::debug!("{} client(s) connected", known.len());
        }

        if client.sources().is_empty() {
            thread::sleep(MONITOR_INTERVAL);
        }
    }

    client.close();
    Ok(())
}
