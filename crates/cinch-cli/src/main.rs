//! Command line front end for the cinch PE packer.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cinch_core::config::{PackConfig, Tristate};
use cinch_core::error::PeError;
use cinch_core::io::{FileSink, FileSource};
use cinch_core::stub::BaselineStub;
use cinch_core::XzCodec;

#[derive(Parser, Debug)]
#[command(name = "cinch", version, about = "PE executable packer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

fn parse_tristate(s: &str) -> Result<Tristate, String> {
    match s {
        "auto" => Ok(Tristate::Auto),
        "0" | "no" | "false" => Ok(Tristate::No),
        "1" | "yes" | "true" => Ok(Tristate::Yes),
        other => Err(format!("expected auto/yes/no, got {other}")),
    }
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Compress a PE executable into a self-extracting image
    Pack {
        /// Input PE file path
        input: PathBuf,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
        /// Compression level (1-9)
        #[arg(short, long, default_value_t = 7)]
        level: u32,
        /// Relax structural checks (duplicate relocs, ASLR strip, ...)
        #[arg(long)]
        force: bool,
        /// Require a byte-identical round trip (refused for PE)
        #[arg(long)]
        exact: bool,
        /// Strip the base relocation directory
        #[arg(long, value_parser = parse_tristate, default_value = "auto")]
        strip_relocs: Tristate,
        /// Also compress the export directory of executables
        #[arg(long)]
        compress_exports: bool,
        /// Compress resource leaves
        #[arg(long, value_parser = parse_tristate, default_value = "auto")]
        compress_resources: Tristate,
        /// Icon policy: 0 never, 1 keep the first icon, 2 keep the
        /// first group, 3 compress everything
        #[arg(long, default_value_t = 1)]
        compress_icons: u8,
        /// Keep resources matching "type[/name],..." uncompressed
        #[arg(long, default_value = "")]
        keep_resource: String,
    },
    /// Restore the original executable from a packed one
    Unpack {
        /// Packed PE file path
        input: PathBuf,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
        /// Relax consistency checks
        #[arg(long)]
        force: bool,
    },
}

fn run(cli: Cli) -> Result<(), PeError> {
    match cli.command {
        Command::Pack {
            input,
            output,
            level,
            force,
            exact,
            strip_relocs,
            compress_exports,
            compress_resources,
            compress_icons,
            keep_resource,
        } => {
            if compress_icons > 3 {
                return Err(PeError::cant_pack("--compress-icons takes 0..=3"));
            }
            let cfg = PackConfig {
                force,
                exact,
                level,
                strip_relocs,
                compress_exports,
                compress_resources,
                compress_icons,
                keep_resource,
                ..PackConfig::default()
            };
            let mut fi = FileSource::open(&input)?;
            let mut fo = FileSink::create(&output)?;
            let mut codec = XzCodec::new(cfg.level);
            let mut stub = BaselineStub::new();
            println!("[*] packing {}", input.display());
            let outcome = cinch_core::pack(&mut fi, &mut fo, &cfg, &mut codec, &mut stub)?;
            let ratio = 100.0 * outcome.out_size as f64 / outcome.in_size as f64;
            println!(
                "[*] {} -> {} bytes ({ratio:.1}%), written to {}",
                outcome.in_size,
                outcome.out_size,
                output.display()
            );
        }
        Command::Unpack {
            input,
            output,
            force,
        } => {
            let mut fi = FileSource::open(&input)?;
            let mut fo = FileSink::create(&output)?;
            let mut codec = XzCodec::new(7);
            println!("[*] unpacking {}", input.display());
            let outcome = cinch_core::unpack(&mut fi, &mut fo, force, &mut codec)?;
            println!(
                "[*] restored {} bytes to {}",
                outcome.out_size,
                output.display()
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ PeError::Internal(_)) => {
            eprintln!("cinch: {err} (this is a bug, please report it)");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("cinch: {err}");
            ExitCode::FAILURE
        }
    }
}
