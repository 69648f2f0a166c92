mod progress;

use clap::{Parser, Subcommand};
use frtool_lib::job::FlashromLauncher;
use frtool_lib::{FlashController, FlasherConfig, image, util};
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about = "frtool CLI", long_about = None)]
struct Cli {
    /// Programmer/interface selection passed to the flashing tool
    #[arg(short = 'p', long = "programmer")]
    programmer: Option<String>,

    /// Flashing tool executable: a name searched on PATH or an explicit path
    #[arg(long = "tool", default_value = "flashrom")]
    tool: String,

    /// Explicit chip selection, for setups where probing is ambiguous
    #[arg(short = 'c', long = "chip")]
    chip: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe the attached chip for identity and capacity
    Probe,

    /// List the programmers the flashing tool supports
    #[command(name = "list_programmers")]
    ListProgrammers,

    /// Read the chip into a ROM image file
    Read(ReadArgs),

    /// Write a ROM image file to the chip
    Write(WriteArgs),
}

#[derive(Parser, Debug)]
struct ReadArgs {
    /// Destination file for the ROM dump
    output: PathBuf,

    /// Truncate the dump to this logical size before saving (e.g. 4M, 0x100000)
    #[arg(long = "unpad-to")]
    unpad_to: Option<String>,

    /// Strip the trailing run of 0xFF padding from the dump (heuristic)
    #[arg(long = "trim", conflicts_with = "unpad_to")]
    trim: bool,
}

#[derive(Parser, Debug)]
struct WriteArgs {
    /// ROM image to flash
    input: PathBuf,

    /// Chip capacity to pad to (e.g. 16M); probed automatically when omitted
    #[arg(long = "size")]
    size: Option<String>,
}

fn run(args: Cli) -> anyhow::Result<()> {
    let config = FlasherConfig {
        tool: args.tool,
        programmer: args.programmer,
        chip: args.chip,
        ..FlasherConfig::default()
    };

    if let Ok(version) = FlashromLauncher::new(config.clone()).tool_version() {
        tracing::info!(version, tool = %config.tool, "flashing tool detected");
    }

    match args.command {
        Commands::ListProgrammers => {
            for programmer in FlashromLauncher::new(config).list_programmers()? {
                println!("{}", programmer);
            }
        }
        Commands::Probe => {
            let completion = controller_for(config).probe()?;
            if completion.catalog.is_ambiguous() {
                eprintln!(
                    "Warning: {} possible chips detected; select one with --chip",
                    completion.catalog.len()
                );
            }
            for chip in completion.catalog.chips() {
                println!("{} ({} kB)", chip.identifier(), chip.capacity / 1024);
            }
        }
        Commands::Read(read) => {
            let unpad_to = read.unpad_to.as_deref().map(util::parse_size).transpose()?;
            controller_for(config).read(&read.output, unpad_to)?;
            if read.trim {
                let data = fs::read(&read.output)?;
                let keep = image::trim_padding(&data);
                fs::write(&read.output, &data[..keep])?;
                println!("Removed {} bytes of padding", data.len() - keep);
            }
            println!("ROM saved to {}", read.output.display());
        }
        Commands::Write(write) => {
            let capacity = write.size.as_deref().map(util::parse_size).transpose()?;
            let completion = controller_for(config).write(&write.input, capacity)?;
            match completion.chip {
                Some(chip) => println!("ROM written to {}", chip.identifier()),
                None => println!("ROM written"),
            }
        }
    }
    Ok(())
}

fn controller_for(config: FlasherConfig) -> FlashController {
    FlashController::new(config, progress::create_progress_sink())
}

fn main() {
    // Log level comes from RUST_LOG (e.g. RUST_LOG=frtool_lib=debug);
    // defaults to off so tool output stays the only thing on screen.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Cli::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
