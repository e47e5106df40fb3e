use anyhow::Context;
use clap::Parser;
use embassy_executor::{Executor, Spawner};
use env_logger::Builder;
use log::{LevelFilter, error, info};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use dvhop_simulator::common::scene::{Scene, load_scene};
use dvhop_simulator::config::SimulationConfig;
use dvhop_simulator::simulation::network_task;
use dvhop_simulator::simulation::report::ReportWriter;
use dvhop_simulator::simulation::types::{SimulationEventQueue, SimulationEventSender};
use dvhop_simulator::time_driver::set_simulation_speed_percent;

/// How often the main thread drains the event queue.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// DV-Hop localization simulator.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Scene file (JSON)
    #[arg(short, long)]
    scene: PathBuf,

    /// Run configuration (TOML). Defaults to config.toml next to the scene.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the CSV, dumps and summary
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Seed for beacon selection, jitter and the radio medium
    #[arg(long)]
    seed: Option<u64>,

    /// Virtual clock speed in percent of real time
    #[arg(long)]
    speed: Option<u32>,

    /// Log protocol internals
    #[arg(short, long)]
    verbose: bool,
}

fn embassy_init(spawner: Spawner, scene: Scene, config: SimulationConfig, events_tx: SimulationEventSender) {
    let spawned = spawner.spawn(network_task(spawner, scene, config, events_tx));
    if spawned.is_err() {
        error!("Failed to spawn network task");
    }
}

fn load_config(args: &Args) -> anyhow::Result<SimulationConfig> {
    let mut config = match &args.config {
        Some(path) => SimulationConfig::load(path),
        None => SimulationConfig::load_or_default(&SimulationConfig::config_path_from_scene(&args.scene)),
    }?;

    if let Some(output_dir) = &args.output_dir {
        config.output_dir = output_dir.clone();
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(speed) = args.speed {
        config.speed_percent = speed;
    }
    config.validate().map_err(anyhow::Error::msg).context("Invalid command line override")?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logging setup; RUST_LOG still overrides these defaults.
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("dvhop_simulator"), if args.verbose { LevelFilter::Trace } else { LevelFilter::Debug })
        .parse_default_env()
        .init();

    info!("Starting up");

    let scene = load_scene(&args.scene).with_context(|| format!("Failed to load scene {}", args.scene.display()))?;
    let config = load_config(&args)?;
    info!(
        "Scene {}: {} nodes, seed {}, {} ms at {}% speed",
        args.scene.display(),
        scene.node_count(),
        config.seed,
        config.duration_ms,
        config.speed_percent
    );

    let mut report = ReportWriter::create(&config.output_dir)?;
    set_simulation_speed_percent(config.speed_percent);

    let event_queue: &'static SimulationEventQueue = Box::leak(Box::new(SimulationEventQueue::new()));
    let events_tx = event_queue.sender();
    let events_rx = event_queue.receiver();

    // Spawn Embassy executor on a dedicated background thread
    let executor_config = config.clone();
    thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .name("embassy-executor".to_string())
        .spawn(move || {
            // Leak the executor to satisfy the 'static lifetime required by run()
            let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| embassy_init(spawner, scene, executor_config, events_tx));
        })
        .context("Failed to spawn embassy thread")?;

    let medium = loop {
        match events_rx.try_receive() {
            Ok(event) => {
                if let Some(medium) = report.record(event)? {
                    break medium;
                }
            }
            Err(_) => thread::sleep(EVENT_POLL_INTERVAL),
        }
    };

    let summary = report.finish(&args.scene, config.seed, config.duration_ms, medium)?;
    let localization = &summary.localization;
    info!(
        "Localized {}/{} unknown nodes, mean error {}, max error {}",
        localization.localized_count,
        localization.node_count - localization.beacon_count,
        localization.mean_error.map_or("n/a".to_string(), |e| format!("{:.2}", e)),
        localization.max_error.map_or("n/a".to_string(), |e| format!("{:.2}", e)),
    );
    info!("Results written to {}", config.output_dir.display());
    Ok(())
}
