use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use devxfer::adapters::{self, DeviceSource, SimulatedDevice};
use devxfer::config::AppConfig;
use devxfer::context::AppContext;
use devxfer::core::{Channel, DeviceSession, ExportEvent, ExportItem, ExportRequest};
use devxfer::logging;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devxfer")]
#[command(about = "Browse, stream and export files from an attached device", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./devxfer.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigArgs,

    #[command(flatten)]
    device: DeviceArgs,
}

#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none", rename = "log_json")]
    #[arg(long = "json-logs", global = true)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct DeviceArgs {
    /// Serve a mounted device directory
    #[arg(long, global = true, conflicts_with = "simulation")]
    root: Option<PathBuf>,

    /// Directory for the alternate channel
    #[arg(long, global = true, requires = "root")]
    alt_root: Option<PathBuf>,

    /// Use an in-memory device with sample files
    #[arg(long, global = true)]
    simulation: bool,

    /// Use the alternate channel instead of the primary one
    #[arg(long, global = true)]
    alt: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List a device directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Serve one device file over loopback HTTP until Ctrl-C
    Stream { path: String },
    /// Copy device files into a local directory
    Export {
        #[arg(long)]
        dest: PathBuf,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref(), Some(&cli.overrides))
        .context("Failed to load configuration")?;
    logging::init((&config).into());

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml().context("Failed to render configuration")?);
        return Ok(());
    }

    let ctx = AppContext::new(config);
    let channel = if cli.device.alt {
        Channel::Alternate
    } else {
        Channel::Primary
    };

    let source = device_source(&cli.device)?;
    let device = adapters::connect("device-0", source).context("Failed to attach device")?;
    let session = DeviceSession::open(device, ctx.config.clone());

    let result = match cli.command {
        Commands::Ls { path } => run_ls(&session, channel, &path).await,
        Commands::Stream { path } => run_stream(&session, channel, &path).await,
        Commands::Export { dest, paths } => run_export(&session, channel, dest, paths).await,
        Commands::Config => Ok(()),
    };

    session.close().await;
    result
}

fn device_source(args: &DeviceArgs) -> Result<DeviceSource> {
    if args.simulation {
        return Ok(DeviceSource::Simulated(SimulatedDevice::seeded()));
    }
    match &args.root {
        Some(root) => Ok(DeviceSource::Local {
            root: root.clone(),
            alternate_root: args.alt_root.clone(),
        }),
        None => bail!("No device selected: pass --root <dir> or --simulation"),
    }
}

async fn run_ls(session: &DeviceSession, channel: Channel, path: &str) -> Result<()> {
    let entries = session
        .list_directory(channel, path)
        .await
        .with_context(|| format!("Failed to list {}", path))?;

    for entry in entries {
        let kind = if entry.stat.is_directory { "d" } else { "-" };
        println!("{} {:>12} {}", kind, entry.stat.size, entry.name);
    }
    Ok(())
}

async fn run_stream(session: &DeviceSession, channel: Channel, path: &str) -> Result<()> {
    let url = session
        .stream_url(channel, path)
        .await
        .with_context(|| format!("Failed to stream {}", path))?;
    println!("{}", url);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    session.release_stream(channel, path).await;
    Ok(())
}

async fn run_export(
    session: &DeviceSession,
    channel: Channel,
    dest: PathBuf,
    paths: Vec<String>,
) -> Result<()> {
    let request = ExportRequest {
        items: paths.into_iter().map(ExportItem::from_path).collect(),
        destination: dest,
        channel,
    };
    let mut job = session
        .start_export(request)
        .context("Failed to start export")?;
    let job_id = job.job_id.clone();

    loop {
        tokio::select! {
            event = job.next_event() => match event {
                Some(ExportEvent::ItemFinished { result, .. }) => {
                    eprintln!(
                        "{} {} ({} bytes)",
                        if result.success { "ok  " } else { "FAIL" },
                        result.source_path,
                        result.bytes_transferred
                    );
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                session.cancel_export(&job_id);
            }
        }
    }

    let summary = job.wait().await.context("Export worker failed")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.failed_items > 0 {
        bail!("{} of {} items failed", summary.failed_items, summary.total_items);
    }
    Ok(())
}
