use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

/// Rule granting non-root access to a Qualcomm device in EDL mode.
const UDEV_RULE: &str =
    "SUBSYSTEM==\"usb\", ATTR{idVendor}==\"05c6\", ATTR{idProduct}==\"9008\", MODE=\"0666\", TAG+=\"uaccess\"\n";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Developer tasks for the firehose workspace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run the firehose CLI
    Run {
        /// Arguments forwarded to the CLI after `--`
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Print the udev rule for unprivileged EDL access
    Udev,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            let status = Command::new("cargo").arg("build").status()?;
            if !status.success() {
                anyhow::bail!("Build failed");
            }
        }
        Commands::Run { args } => {
            let status = Command::new("cargo")
                .args(["run", "-p", "firehose-cli", "--"])
                .args(args)
                .status()?;
            if !status.success() {
                anyhow::bail!("Run failed");
            }
        }
        Commands::Udev => {
            println!("# /etc/udev/rules.d/51-edl.rules");
            print!("{UDEV_RULE}");
        }
    }

    Ok(())
}
