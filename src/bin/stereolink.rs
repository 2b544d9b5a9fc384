//! Command-line client: discovery, parameter access and image capture.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use stereolink::{
    DeviceDescriptor, DeviceEnumeration, NetworkProtocol, ParameterValue, Stereolink,
    TransferConfig, UpdateRate,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stereolink")]
#[command(about = "Discover stereo devices, read and write parameters, capture image sets")]
#[command(version)]
struct Cli {
    /// YAML transfer configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device image port address; discovered when omitted
    #[arg(short, long, global = true)]
    device: Option<SocketAddr>,

    /// Use UDP instead of TCP for --device
    #[arg(long, global = true)]
    udp: bool,

    /// How long to wait for discovery replies
    #[arg(long, global = true, default_value = "1000")]
    discovery_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List devices answering the discovery broadcast
    Discover,

    /// Read or write device parameters
    Params {
        #[command(subcommand)]
        action: ParamsAction,
    },

    /// Save received image sets as blob files
    Capture {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Number of image sets to save
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        /// Maximum sets per second, 0 for the device rate
        #[arg(long, default_value = "0")]
        max_fps: u32,
    },
}

#[derive(Subcommand)]
enum ParamsAction {
    /// Print every parameter with its current value
    List,
    /// Print one parameter
    Get { id: String },
    /// Write one parameter; booleans, integers and decimals are recognized
    Set { id: String, value: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stereolink=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TransferConfig::from_file(path)?,
        None => TransferConfig::default(),
    };
    config.validate()?;

    match &cli.command {
        Command::Discover => discover(&cli, config).await,
        Command::Params { action } => params(&cli, config, action).await,
        Command::Capture { output, count, max_fps } => {
            capture(&cli, config, output, *count, *max_fps).await
        }
    }
}

async fn discover(cli: &Cli, config: TransferConfig) -> Result<()> {
    let devices = Stereolink::discover(Duration::from_millis(cli.discovery_ms), &config).await?;
    if devices.is_empty() {
        println!("No devices found");
    }
    for device in devices {
        println!("{device}");
    }
    Ok(())
}

async fn resolve_device(cli: &Cli, config: &TransferConfig) -> Result<DeviceDescriptor> {
    if let Some(address) = cli.device {
        let protocol = if cli.udp { NetworkProtocol::Udp } else { NetworkProtocol::Tcp };
        return Ok(DeviceDescriptor::at(address, protocol));
    }
    let devices = DeviceEnumeration::new(config.clone())
        .require_devices(Duration::from_millis(cli.discovery_ms))
        .await?;
    let device = devices
        .into_iter()
        .find(|d| d.compatible)
        .context("only incompatible devices found")?;
    info!(%device, "Using first discovered device");
    Ok(device)
}

async fn params(cli: &Cli, config: TransferConfig, action: &ParamsAction) -> Result<()> {
    let device = resolve_device(cli, &config).await?;
    let connection = Stereolink::connect(&device, config).await?;
    let params = connection.parameters();

    match action {
        ParamsAction::List => {
            let set = params.get_parameter_set().await?;
            for descriptor in &set {
                let marker = if descriptor.is_modified() { "*" } else { " " };
                let access = if descriptor.is_writable() { "rw" } else { "ro" };
                println!(
                    "{marker} {:<32} {access} {} {}",
                    descriptor.uid, descriptor.current, descriptor.unit
                );
            }
        }
        ParamsAction::Get { id } => {
            let descriptor = params.get_parameter(id).await?;
            println!("{} = {} {}", descriptor.uid, descriptor.current, descriptor.unit);
            if let Some(range) = descriptor.range {
                println!("  range {} ..= {}", range.min, range.max);
            }
            for option in &descriptor.options {
                println!("  option {} ({})", option.value, option.description);
            }
        }
        ParamsAction::Set { id, value } => {
            // Fetch first so the write is validated locally
            params.get_parameter_set().await?;
            params.set_parameter(id, parse_value(value)).await?;
            println!("{id} = {}", params.get_parameter(id).await?.current);
        }
    }
    connection.close();
    Ok(())
}

async fn capture(
    cli: &Cli,
    config: TransferConfig,
    output: &Path,
    count: usize,
    max_fps: u32,
) -> Result<()> {
    std::fs::create_dir_all(output).with_context(|| format!("cannot create {}", output.display()))?;
    let device = resolve_device(cli, &config).await?;
    let connection = Stereolink::connect(&device, config).await?;

    let rate = if max_fps == 0 { UpdateRate::Native } else { UpdateRate::Max(max_fps) };
    let mut sets = Box::pin(connection.images().image_sets(rate).take(count));
    let mut saved = 0usize;
    while let Some(set) = sets.next().await {
        let path = output.join(format!("imageset-{:08}.slis", set.sequence_number));
        std::fs::write(&path, set.to_blob()?)
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!(sequence = set.sequence_number, path = %path.display(), "Saved image set");
        saved += 1;
    }

    let stats = connection.images().stats();
    connection.close();
    if saved < count {
        warn!(saved, count, ?stats, "Session ended before all image sets arrived");
        bail!("saved {saved} of {count} image sets");
    }
    println!("Saved {saved} image sets to {}", output.display());
    Ok(())
}

fn parse_value(text: &str) -> ParameterValue {
    if let Ok(flag) = text.parse::<bool>() {
        ParameterValue::Bool(flag)
    } else if let Ok(int) = text.parse::<i64>() {
        ParameterValue::Int(int)
    } else if let Ok(double) = text.parse::<f64>() {
        ParameterValue::Double(double)
    } else {
        ParameterValue::String(text.to_string())
    }
}
