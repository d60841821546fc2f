use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use micronir::logging::init_rust_logging;
use micronir::{
    BleConfig, Dialect, DriverConfig, Endianness, LogSink, MicroNir, SerialConfig, Spectrum,
};

#[derive(Parser, Debug)]
#[command(name = "micronir-demo", about = "Connect to a MicroNIR and run one operation")]
struct Args {
    /// Use the serial transport, optionally on a given port (auto-detected otherwise)
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "", conflicts_with = "ble")]
    serial: Option<String>,
    /// Use the BLE transport
    #[arg(long)]
    ble: bool,
    /// TOML configuration file; --serial/--ble override its transport
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Sample byte order: le or be
    #[arg(long)]
    endian: Option<Endianness>,
    /// Command dialect: ascii, framed, binary or binary-etx
    #[arg(long)]
    dialect: Option<Dialect>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Acquire one spectrum
    Scan,
    /// Lamp off, then scan
    Dark,
    /// Warm up, lamp on, settle, then scan
    White,
    /// Query the firmware version
    Version,
    /// Listen passively and dump whatever arrives
    Sniff {
        #[arg(long, default_value_t = 3000)]
        ms: u64,
    },
    /// Switch the lamp on or off
    Lamp {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
}

fn build_config(args: &Args) -> Result<DriverConfig> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DriverConfig::default(),
    };
    if let Some(port) = &args.serial {
        let serial = if port.is_empty() {
            SerialConfig::default()
        } else {
            SerialConfig::default().with_port(port.clone())
        };
        config.transport = micronir::TransportConfig::Serial(serial);
    } else if args.ble {
        config.transport = micronir::TransportConfig::Ble(BleConfig::default());
    }
    if let Some(endian) = args.endian {
        config = config.with_endianness(endian);
    }
    if let Some(dialect) = args.dialect {
        config = config.with_dialect(dialect);
    }
    config.validate()?;
    Ok(config)
}

fn print_spectrum(spectrum: Option<Spectrum>) -> Result<()> {
    let Some(spectrum) = spectrum else {
        bail!("no spectrum received");
    };
    println!("{:>6}  {:>6}  {:>8}", "nm", "raw", "norm");
    for (point, raw) in spectrum.points().zip(spectrum.raw()) {
        println!(
            "{:>6}  {:>6}  {:>8.5}",
            point.wavelength_nm, raw, point.intensity
        );
    }
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    init_rust_logging();
    let args = Args::parse();
    let config = build_config(&args)?;

    let nir = MicroNir::new(config, Some(LogSink::new(|line| println!("  {line}"))));
    let info = nir.connect().await.context("connect")?;
    println!("--- {} [{}] ({}) ---", info.display_name, info.descriptor, info.status);

    let outcome = match args.command {
        Cmd::Scan => nir.scan().await.map_err(anyhow::Error::from).and_then(print_spectrum),
        Cmd::Dark => nir
            .dark_reference()
            .await
            .map_err(anyhow::Error::from)
            .and_then(print_spectrum),
        Cmd::White => nir
            .white_reference()
            .await
            .map_err(anyhow::Error::from)
            .and_then(print_spectrum),
        Cmd::Version => nir.get_system_info().await.map_err(anyhow::Error::from),
        Cmd::Sniff { ms } => match nir.sniff(Duration::from_millis(ms)).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(anyhow::anyhow!("nothing received in {ms} ms")),
            Err(e) => Err(e.into()),
        },
        Cmd::Lamp { state } => match nir.set_lamp(state == "on").await {
            Ok(true) => Ok(()),
            Ok(false) => Err(anyhow::anyhow!("lamp command not sent")),
            Err(e) => Err(e.into()),
        },
    };

    nir.disconnect().await;
    outcome
}
