mod clock;
mod config;
mod db;
mod error;
mod gate;
mod iio;
mod mqtt;
#[cfg_attr(not(feature = "hw"), allow(dead_code))]
mod pms5003;
mod reading;
mod remote;
mod sampler;
mod sensor;
#[cfg(feature = "sim")]
mod sim;
mod sink;

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use std::{env, io};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use config::{Backend, Config, SamplingConfig};
use db::LocalStore;
use iio::IioBoard;
use mqtt::Publisher;
use remote::RemoteStore;
use sampler::SamplingLoop;
use sensor::{Board, SensorReader};
use sink::Sink;

const CPUINFO: &str = "/proc/cpuinfo";

/// Day/night cycle of the simulated board, in seconds.
#[cfg(feature = "sim")]
const SIM_DAY_SECS: f64 = 86_400.0;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "enviro.toml".to_string());
    let cfg = config::load(&config_path)?;

    init_logging(&cfg)?;
    tracing::info!(config = %config_path, "enviro starting");

    // ── Local store ─────────────────────────────────────────────────
    let local = LocalStore::open(&cfg.db.local_path).await?;
    local.ensure_schema().await?;
    tracing::info!(path = %cfg.db.local_path.display(), rows = local.count().await?, "local db ready");

    // ── MQTT (optional, never fatal) ────────────────────────────────
    let publisher = if cfg.mqtt.enabled {
        let serial = mqtt::read_device_serial(Path::new(CPUINFO));
        Publisher::connect(&cfg.mqtt, &serial).await
    } else {
        tracing::info!("mqtt disabled in config");
        None
    };

    // ── Remote store (optional) ─────────────────────────────────────
    let remote = if cfg.db.remote_enabled() {
        RemoteStore::from_config(&cfg.db)
    } else {
        tracing::info!("no db.host configured, remote store disabled");
        None
    };

    // ── Sensors ─────────────────────────────────────────────────────
    let board = build_board(&cfg.sampling)?;
    let reader = attach_particulate(SensorReader::new(board, cfg.sampling.comp_factor), &cfg.sampling)?;

    // ── Clock guard ─────────────────────────────────────────────────
    clock::wait_for_clock(&local, cfg.sampling.clock_guard_interval()).await;

    // ── Sampling loop ───────────────────────────────────────────────
    let mut sampling = SamplingLoop::new(
        reader,
        Instant::now(),
        cfg.sampling.start_delay(),
        cfg.sampling.tick(),
    );

    let mqtt_sinks: Vec<Box<dyn Sink>> = publisher
        .into_iter()
        .map(|p| Box::new(p) as Box<dyn Sink>)
        .collect();
    sampling.add_channel("mqtt", cfg.mqtt.period(), mqtt_sinks);

    let mut db_sinks: Vec<Box<dyn Sink>> = Vec::new();
    if let Some(remote) = remote {
        db_sinks.push(Box::new(remote));
    }
    db_sinks.push(Box::new(local));
    sampling.add_channel("db", cfg.db.period(), db_sinks);

    sampling.run().await;
    Ok(())
}

/// `RUST_LOG` wins over `log.level`.  With `log.file` set, lines are
/// appended there instead of going to stderr.
fn init_logging(cfg: &Config) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.log.level)
            .with_context(|| format!("invalid log.level: {}", cfg.log.level))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &cfg.log.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file: {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn build_board(cfg: &SamplingConfig) -> Result<Box<dyn Board>> {
    match cfg.backend {
        #[cfg(feature = "sim")]
        Backend::Sim => {
            tracing::info!("using simulated board");
            Ok(Box::new(sim::SimBoard::new(SIM_DAY_SECS)))
        }
        #[cfg(not(feature = "sim"))]
        Backend::Sim => anyhow::bail!("sampling.backend = \"sim\" needs the `sim` feature"),
        Backend::Iio => Ok(Box::new(IioBoard::new(cfg.iio.clone()))),
    }
}

#[cfg(feature = "hw")]
fn attach_particulate<B: Board>(reader: SensorReader<B>, cfg: &SamplingConfig) -> Result<SensorReader<B>> {
    if !cfg.particulate {
        return Ok(reader);
    }
    let pms = pms5003::Pms5003::open(&cfg.pms_device, cfg.pms_reset_pin, cfg.pms_enable_pin)
        .with_context(|| format!("failed to open pms5003 on {}", cfg.pms_device))?;
    Ok(reader.with_particulate(Box::new(pms)))
}

#[cfg(not(feature = "hw"))]
fn attach_particulate<B: Board>(reader: SensorReader<B>, cfg: &SamplingConfig) -> Result<SensorReader<B>> {
    if cfg.particulate {
        anyhow::bail!("sampling.particulate needs the `hw` feature");
    }
    Ok(reader)
}
