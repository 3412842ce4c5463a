//! Command-line front end for the effect runtime.
//!
//! `check` validates an effect file, `run` mounts one headlessly, and
//! `generate` asks the configured generator for a new effect and mounts it.
//! `run` and `generate` print a JSON report on stdout.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use effect_runtime::check::{check_file, read_source};
use effect_runtime::exit_codes;
use effect_runtime::io::config::{DEFAULT_CONFIG_FILE, RuntimeConfig, load_config, write_config};
use effect_runtime::io::transport::CommandTransport;
use effect_runtime::logging;
use effect_runtime::play::{PlayInput, build_supervisor, play};

#[derive(Parser)]
#[command(
    name = "effect-runtime",
    version,
    about = "Generate, validate and run sandboxed visual effects"
)]
struct Cli {
    /// Config file (missing file means defaults).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config file with default values.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Normalize and validate an effect file without running it.
    Check { path: PathBuf },
    /// Mount an effect file and drive it for a number of frames.
    Run {
        path: PathBuf,
        #[arg(long, default_value_t = 60)]
        frames: u32,
    },
    /// Generate an effect from a description, then mount and drive it.
    Generate {
        prompt: String,
        #[arg(long, default_value_t = 60)]
        frames: u32,
        /// Include the generated text in the report.
        #[arg(long)]
        show_source: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Check { path } => cmd_check(&path),
        Command::Run { path, frames } => {
            let cfg = load_config(&cli.config)?;
            let source = read_source(&path)?;
            cmd_play(&cfg, PlayInput::Source(source), frames, false)
        }
        Command::Generate {
            prompt,
            frames,
            show_source,
        } => {
            let cfg = load_config(&cli.config)?;
            cmd_play(&cfg, PlayInput::Prompt(prompt), frames, show_source)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &RuntimeConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_check(path: &Path) -> Result<i32> {
    let report = check_file(path)?;
    match &report.violation {
        None => println!(
            "ok: {} bytes, {} fences stripped, {} teardown rewrites",
            report.bytes, report.fences_stripped, report.teardown_rewrites
        ),
        Some(violation) => println!("rejected: {violation}"),
    }
    Ok(report.exit_code())
}

fn cmd_play(cfg: &RuntimeConfig, input: PlayInput, frames: u32, show_source: bool) -> Result<i32> {
    let mut supervisor = build_supervisor(cfg, CommandTransport::from_config(cfg))?;
    let report = play(&mut supervisor, input, frames, show_source);
    print_json(&report)?;
    Ok(report.exit_code)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize report")?;
    println!("{payload}");
    Ok(())
}
