//! procpipe - run a shell-style pipeline of processes.

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use procpipe::config::ConfigLoader;
use procpipe::display;
use procpipe::pipeline::{self, shutdown_signal, Command, Pipeline, PipelineError, PipelineOptions};

/// Token separating pipeline stages on the command line.
const STAGE_SEPARATOR: &str = "|";

#[derive(Parser)]
#[command(
    name = "procpipe",
    about = "Run processes connected stdout-to-stdin, like a shell pipe",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Kill the whole pipeline after this many milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Path to a config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stream the last stage's stdout line by line instead of buffering it.
    #[arg(long)]
    stream: bool,

    /// Do not truncate status output.
    #[arg(long)]
    raw: bool,

    /// Stages, separated by a literal `|` argument.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "PROGRAM [ARGS]... [| PROGRAM [ARGS]...]..."
    )]
    stages: Vec<String>,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Split `a b | c d` into one command per stage.
fn split_stages(args: &[String]) -> Result<Vec<Command>, String> {
    args.split(|arg| arg == STAGE_SEPARATOR)
        .enumerate()
        .map(|(index, words)| {
            let (program, rest) = words
                .split_first()
                .ok_or_else(|| format!("stage {index} is empty"))?;
            Ok(Command::new(program.as_str()).args(rest.iter().map(String::as_str)))
        })
        .collect()
}

async fn run_captured(
    options: PipelineOptions,
    commands: Vec<Command>,
) -> Result<i32, Box<dyn Error>> {
    let stop = CancellationToken::new();
    let options = options.with_stop_token(stop.clone());
    let watcher = tokio::spawn(async move {
        shutdown_signal().await;
        display::print_stop_requested();
        stop.cancel();
    });

    let result = pipeline::output(options, commands).await;
    watcher.abort();
    let out = result?;

    std::io::stdout().write_all(&out.stdout)?;
    std::io::stderr().write_all(&out.stderr)?;
    display::print_pipeline_end(&out.report, out.timed_out);
    Ok(out.code())
}

async fn run_streaming(
    options: PipelineOptions,
    commands: Vec<Command>,
    grace: Duration,
) -> Result<i32, Box<dyn Error>> {
    let mut pipeline = Pipeline::pipe_output(options, commands)?;
    pipeline.start()?;

    let handle = pipeline.handle();
    let watcher = tokio::spawn(async move {
        shutdown_signal().await;
        display::print_stop_requested();
        if let Err(e) = handle.terminate(grace).await {
            tracing::debug!(error = %e, "Pipeline already finished");
        }
    });

    let stderr = pipeline.take_stderr();
    let errors = tokio::spawn(async move {
        match stderr {
            Some(mut stderr) => tokio::io::copy(&mut stderr, &mut tokio::io::stderr()).await,
            None => Ok(0),
        }
    });

    if let Some(stdout) = pipeline.take_stdout() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            println!("{line}");
        }
    }
    if let Ok(Err(e)) = errors.await {
        tracing::warn!(error = %e, "Failed to forward stderr");
    }

    let result = pipeline.wait().await;
    watcher.abort();
    let (report, timed_out) = match result {
        Ok(report) => (report, false),
        Err(err) => {
            let timed_out = matches!(err, PipelineError::TimedOut { .. });
            (err.into_report()?, timed_out)
        }
    };
    display::print_pipeline_end(&report, timed_out);
    Ok(report.code)
}

async fn run(cli: Cli) -> Result<i32, Box<dyn Error>> {
    let loader = cli
        .config
        .map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    let config = loader.load()?;

    let mut options = config.to_options()?;
    if let Some(ms) = cli.timeout_ms {
        options.timeout = Duration::from_millis(ms);
    }

    let commands = split_stages(&cli.stages)?;
    let description = commands
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ");
    display::print_pipeline_start(&description, cli.raw);
    tracing::info!(pipeline = %description, timeout = ?options.effective_timeout(), "Starting pipeline");

    if cli.stream {
        run_streaming(options, commands, config.terminate_grace()).await
    } else {
        run_captured(options, commands).await
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            display::print_error(&e.to_string());
            1
        }
    };
    std::process::exit(code);
}
