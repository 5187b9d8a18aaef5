use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use firehose_core::auth::{AuthStrategy, XiaomiAuth};
use firehose_core::protocol::FirehoseEngine;
use firehose_core::rawprogram::{generate_program_xml, parse_program_xml};
use firehose_core::session::{CancelToken, FirehoseSession, SessionConfig};
use firehose_core::transport::NusbTransport;
use firehose_core::TracingObserver;

#[derive(Parser, Debug)]
#[command(author, version, about = "Qualcomm Firehose/EDL Flashing Tool (Pure Rust)", long_about = None)]
struct Args {
    /// Storage type of the target device
    #[arg(long, value_enum, default_value_t = Storage::Ufs)]
    storage: Storage,

    /// Loader authentication to run before configure
    #[arg(long, value_enum, default_value_t = Auth::Standard)]
    auth: Auth,

    /// Directory holding digest/signature files for VIP auth
    #[arg(long)]
    programmer_dir: Option<PathBuf>,

    /// Session config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Storage {
    Ufs,
    Emmc,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Auth {
    Standard,
    Vip,
    Xiaomi,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show loader and storage information
    Info {
        #[arg(long, default_value_t = 0)]
        lun: u32,
    },
    /// List partitions from the on-device GPT
    Partitions {
        #[arg(long, default_value_t = 0)]
        lun: u32,
        /// Write the table as a rawprogram XML instead of a listing
        #[arg(long)]
        xml: Option<PathBuf>,
    },
    /// Flash one image to a sector range
    Flash {
        image: PathBuf,
        #[arg(long)]
        start_sector: String,
        #[arg(long, default_value = "0")]
        lun: String,
        #[arg(long, default_value = "image")]
        label: String,
        /// Split the transfer into bounded program exchanges
        #[arg(long)]
        chunked: bool,
    },
    /// Flash every entry of a rawprogram XML, then optionally apply patches
    FlashXml {
        rawprogram: PathBuf,
        /// Directory holding the image files (defaults to the XML's directory)
        #[arg(long)]
        image_dir: Option<PathBuf>,
        #[arg(long)]
        patch: Option<PathBuf>,
    },
    /// Dump a sector range to a file
    Read {
        output: PathBuf,
        #[arg(long)]
        start_sector: String,
        #[arg(long)]
        sectors: u64,
        #[arg(long, default_value = "0")]
        lun: String,
        #[arg(long, default_value = "dump")]
        label: String,
        #[arg(long)]
        chunked: bool,
    },
    /// Erase a sector range
    Erase {
        #[arg(long)]
        start_sector: String,
        #[arg(long)]
        sectors: u64,
        #[arg(long, default_value = "0")]
        lun: String,
    },
    /// Apply a patch XML document
    Patch { patch: PathBuf },
    /// Save the primary GPT of a LUN to a file
    BackupGpt {
        output: PathBuf,
        #[arg(long, default_value_t = 0)]
        lun: u32,
    },
    /// Write a saved GPT image back to sector 0
    RestoreGpt {
        input: PathBuf,
        #[arg(long, default_value_t = 0)]
        lun: u32,
    },
    /// On-device SHA256 over a sector range
    Sha256 {
        #[arg(long)]
        start_sector: String,
        #[arg(long)]
        sectors: u64,
        #[arg(long, default_value_t = 0)]
        lun: u32,
    },
    /// Dump loader memory to a file
    Memdump {
        output: PathBuf,
        #[arg(long, value_parser = parse_u64_maybe_hex)]
        address: u64,
        #[arg(long)]
        size: u64,
    },
    /// Write bytes (hex) into loader memory
    Poke {
        #[arg(long, value_parser = parse_u64_maybe_hex)]
        address: u64,
        /// Hex-encoded bytes
        value: String,
    },
    /// Mark a LUN as the bootable storage drive
    SetBootLun { lun: u32 },
    /// Reboot or power off the device
    Reboot {
        /// reset, off, reset_to_edl
        #[arg(long, default_value = "reset")]
        mode: String,
    },
}

fn parse_u64_maybe_hex(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting firehose tool (nusb backend)...");

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    config.storage_type = match args.storage {
        Storage::Ufs => "ufs".to_string(),
        Storage::Emmc => "emmc".to_string(),
    };

    let transport = NusbTransport::open().context("no EDL device found (expected 05C6:9008)")?;
    let mut session = FirehoseSession::with_config(FirehoseEngine::new(transport), config);
    session.set_observer(std::sync::Arc::new(TracingObserver));

    let strategy = match args.auth {
        Auth::Standard => AuthStrategy::Standard,
        Auth::Vip => {
            let dir = args
                .programmer_dir
                .clone()
                .context("--programmer-dir is required for VIP auth")?;
            AuthStrategy::Vip {
                programmer_dir: dir,
            }
        }
        Auth::Xiaomi => AuthStrategy::Xiaomi(XiaomiAuth::default()),
    };
    session.authenticate(&strategy).context("authentication failed")?;
    session.configure().context("configure failed")?;

    let cancel = CancelToken::new();
    run_command(&mut session, args.command, &cancel)
}

fn run_command(
    session: &mut FirehoseSession<NusbTransport>,
    command: Command,
    cancel: &CancelToken,
) -> Result<()> {
    match command {
        Command::Info { lun } => {
            for (key, value) in session.get_device_info()? {
                println!("{key}: {value}");
            }
            print!("{}", session.get_storage_info(lun)?);
        }
        Command::Partitions { lun, xml } => {
            let partitions = session.load_partition_table(lun)?;
            if let Some(path) = xml {
                std::fs::write(&path, generate_program_xml(&partitions))?;
                info!(path = %path.display(), "Wrote rawprogram XML");
            } else if partitions.is_empty() {
                println!("LUN{lun}: no GPT found");
            } else {
                println!("{:<3} {:<28} {:>12} {:>12} {:>10}", "LUN", "NAME", "START", "SECTORS", "SIZE");
                for p in &partitions {
                    println!(
                        "{:<3} {:<28} {:>12} {:>12} {:>9.1}M",
                        p.lun, p.name, p.start_lba, p.sectors, p.size_mb()
                    );
                }
            }
        }
        Command::Flash {
            image,
            start_sector,
            lun,
            label,
            chunked,
        } => {
            let sent = if chunked {
                let start: u64 = start_sector
                    .parse()
                    .context("--chunked requires a numeric start sector")?;
                session.flash_partition_chunked(&image, start, &lun, &label, cancel)?
            } else {
                session.flash_partition(&image, &start_sector, &lun, &label, 0, cancel)?
            };
            info!(bytes = sent, "Flash complete");
        }
        Command::FlashXml {
            rawprogram,
            image_dir,
            patch,
        } => {
            let content = std::fs::read_to_string(&rawprogram)?;
            let entries = parse_program_xml(&content, Some(session.sector_size()));
            if entries.is_empty() {
                bail!("no <program> entries in {}", rawprogram.display());
            }
            let dir = match image_dir {
                Some(dir) => dir,
                None => rawprogram
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from(".")),
            };
            session.run_program_entries(&dir, &entries, cancel)?;
            if let Some(patch_path) = patch {
                let patch_content = std::fs::read_to_string(&patch_path)?;
                let applied = session.apply_patch_xml(&patch_content)?;
                info!(applied, "Patches applied");
            }
        }
        Command::Read {
            output,
            start_sector,
            sectors,
            lun,
            label,
            chunked,
        } => {
            let mut file = std::fs::File::create(&output)?;
            let filename = output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| label.clone());
            let got = if chunked {
                let start: u64 = start_sector
                    .parse()
                    .context("--chunked requires a numeric start sector")?;
                session.read_partition_chunked(&mut file, start, sectors, &lun, &label, &filename, cancel)?
            } else {
                session.read_partition(&mut file, &start_sector, sectors, &lun, &label, &filename, cancel)?
            };
            file.flush()?;
            info!(bytes = got, path = %output.display(), "Read complete");
        }
        Command::Erase {
            start_sector,
            sectors,
            lun,
        } => {
            session.erase(&start_sector, sectors, &lun)?;
        }
        Command::Patch { patch } => {
            let content = std::fs::read_to_string(&patch)?;
            let applied = session.apply_patch_xml(&content)?;
            info!(applied, "Patches applied");
        }
        Command::BackupGpt { output, lun } => {
            session.backup_gpt(&output, lun)?;
        }
        Command::RestoreGpt { input, lun } => {
            session.restore_gpt(&input, lun)?;
        }
        Command::Sha256 {
            start_sector,
            sectors,
            lun,
        } => match session.get_sha256(lun, &start_sector, sectors)? {
            Some(digest) => println!("{digest}"),
            None => bail!("loader does not support getsha256digest"),
        },
        Command::Memdump {
            output,
            address,
            size,
        } => {
            let mut file = std::fs::File::create(&output)?;
            session.dump_memory(&mut file, address, size, cancel)?;
            info!(path = %output.display(), "Memory dump complete");
        }
        Command::Poke { address, value } => {
            let data = hex::decode(value.trim()).context("value must be hex")?;
            session.poke(address, &data)?;
        }
        Command::SetBootLun { lun } => {
            session.set_bootable_lun(lun)?;
        }
        Command::Reboot { mode } => {
            session.power(&mode)?;
        }
    }
    Ok(())
}
