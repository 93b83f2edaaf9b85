//! `ScoreGen` CLI
//!
//! Runs one worker command from the terminal: resolves configuration, starts
//! the native worker through the bridge, prints the worker's output and shuts
//! the worker down again.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use scoregen_bridge::commands::CommandSpec;
use scoregen_bridge::{Bridge, Completion, PdfRequest, TakeMetadata};
use scoregen_core::config::{Config, load_config};
use scoregen_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "scoregen")]
#[command(version, about = "ScoreGen - audio to notation through the native worker")]
struct Cli {
    /// Path to the worker executable (overrides config)
    #[arg(long, global = true)]
    worker_bin: Option<PathBuf>,

    /// Argument passed to the worker; repeat for several
    #[arg(long = "worker-arg", global = true, allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// Default request timeout in seconds (overrides config)
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "SCOREGEN_LOG_JSON")]
    log_json: bool,

    /// Directory holding `.scoregen/settings.json` (defaults to the current directory)
    #[arg(long, global = true, env = "SCOREGEN_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Transcribe the recorded take into MusicXML.
    ProcessAudio {
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        work_number: String,
        #[arg(long, default_value = "")]
        movement_number: String,
        #[arg(long, default_value = "")]
        movement_title: String,
        #[arg(long, default_value = "")]
        creator: String,
        #[arg(long, default_value = "")]
        instrument: String,
        #[arg(long, default_value = "4/4")]
        time_signature: String,
    },
    /// Lay out a MusicXML file as PDF.
    GeneratePdf {
        #[arg(long)]
        musicxml: PathBuf,
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Send an arbitrary command with a JSON payload.
    Send {
        command: String,
        /// JSON payload (must not be `null`)
        payload: String,
        /// Success sentinel; required unless the command is declared or framed
        #[arg(long, requires = "failure", conflicts_with = "framed")]
        success: Option<String>,
        /// Failure sentinel
        #[arg(long, requires = "success", conflicts_with = "framed")]
        failure: Option<String>,
        /// Wait for a `@@scoregen` completion frame instead of sentinels
        #[arg(long)]
        framed: bool,
    },
    /// List declared commands.
    Commands,
}

/// Layer command-line flags over the resolved configuration.
fn apply_cli(cli: &Cli, config: &mut Config) {
    if let Some(bin) = &cli.worker_bin {
        config.worker.bin.clone_from(bin);
    }
    if !cli.worker_args.is_empty() {
        config.worker.args.clone_from(&cli.worker_args);
    }
    if let Some(secs) = cli.timeout_secs {
        config.requests.default_timeout_secs = secs;
    }
    if let Some(level) = &cli.log_level {
        config.log_level.clone_from(level);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let mut config = load_config(Some(&project_dir))?;
    apply_cli(&cli, &mut config);
    config.validate()?;

    init_tracing(&default_filter(&config.log_level), cli.log_json);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        worker = %config.worker.bin.display(),
        "Starting scoregen"
    );

    let bridge = Bridge::new(&config)?;
    if matches!(cli.command, Cmd::Commands) {
        print_commands(&bridge);
        return Ok(());
    }

    let result = run(&bridge, cli.command).await;
    bridge.shutdown().await;
    let completion = result?;
    debug!(
        worker_id = %completion.worker_id,
        elapsed_ms = u64::try_from(completion.elapsed.as_millis()).unwrap_or(u64::MAX),
        "Command finished"
    );
    print_output(&completion);
    Ok(())
}

async fn run(bridge: &Bridge, cmd: Cmd) -> anyhow::Result<Completion> {
    let completion = match cmd {
        Cmd::ProcessAudio {
            title,
            work_number,
            movement_number,
            movement_title,
            creator,
            instrument,
            time_signature,
        } => {
            let take = TakeMetadata {
                work_title: title,
                work_number,
                movement_number,
                movement_title,
                creator_name: creator,
                instrument,
                time_signature,
            };
            bridge.process_audio(&take).await?
        }
        Cmd::GeneratePdf {
            musicxml,
            output_dir,
        } => {
            let request = PdfRequest {
                musicxml_path: musicxml,
                output_dir,
            };
            bridge.generate_pdf(&request).await?
        }
        Cmd::Send {
            command,
            payload,
            success,
            failure,
            framed,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let command = match (success, failure) {
                (Some(success), Some(failure)) => bridge.define_command(command, success, failure),
                _ if framed => bridge.command_from_spec(CommandSpec::framed(command)),
                _ => bridge.command(&command)?,
            };
            command.invoke(payload).await?
        }
        Cmd::Commands => anyhow::bail!("commands does not talk to the worker"),
    };
    Ok(completion)
}

#[allow(clippy::print_stdout)]
fn print_output(completion: &Completion) {
    print!("{}", completion.output);
}

#[allow(clippy::print_stdout)]
fn print_commands(bridge: &Bridge) {
    for spec in bridge.commands() {
        let timeout = spec.timeout.unwrap_or_else(|| bridge.default_timeout());
        match &spec.matcher {
            scoregen_bridge::Matcher::Sentinel { success, failure } => println!(
                "{}  timeout={}s  success={success:?}  failure={failure:?}",
                spec.name,
                timeout.as_secs()
            ),
            scoregen_bridge::Matcher::Framed => {
                println!("{}  timeout={}s  framed", spec.name, timeout.as_secs());
            }
        }
    }
}
