use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use jedi_common::{Command, ExecRequest, Identity, RuntimeError, RuntimeResult, UNSET_ID};
use jedi_runtime::{admission, registry, BackendKind, Process, RuntimeConfig, SpawnOutcome};

/// Jedi exec - run one command concurrently through the process runtime
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runtime configuration file path (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend to use (overrides config)
    #[arg(short, long, value_parser = ["host", "unix"])]
    backend: Option<String>,

    /// Number of concurrent executions
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Admission cap for the unix backend (overrides config)
    #[arg(long)]
    max_processes: Option<usize>,

    /// Run the child as this uid (-1 keeps the caller's)
    #[arg(long, default_value_t = UNSET_ID, allow_hyphen_values = true)]
    uid: i32,

    /// Run the child as this gid (-1 keeps the caller's)
    #[arg(long, default_value_t = UNSET_ID, allow_hyphen_values = true)]
    gid: i32,

    /// Redirect the child's stdout to this file
    #[arg(long, value_name = "PATH")]
    stdout: Option<PathBuf>,

    /// Redirect the child's stderr to this file
    #[arg(long, value_name = "PATH")]
    stderr: Option<PathBuf>,

    /// Feed the child's stdin from this file
    #[arg(long, value_name = "PATH")]
    stdin: Option<PathBuf>,

    /// Kill executions still running after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Command line split on whitespace, instead of a trailing command
    #[arg(long, conflicts_with = "command")]
    shell_line: Option<String>,

    /// Program and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging(args.debug)?;

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load_from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(backend) = &args.backend {
        config.backend = backend.parse::<BackendKind>()?;
    }
    if let Some(max) = args.max_processes {
        config.admission.max_processes = max;
    }
    registry::init(&config)?;

    let request = build_request(&args)?;
    let backend = registry::runtime();
    info!(
        "Running '{}' {} time(s) on the {} backend",
        request.command,
        args.count,
        backend.name()
    );

    let mut processes = Vec::with_capacity(args.count);
    for index in 0..args.count {
        match backend.exec(request.clone()) {
            Ok(process) => processes.push((index, Some(Arc::new(process)))),
            Err(e) => {
                error!("Execution {} could not start: {}", index, e);
                println!("{} - error({})", index, e);
                processes.push((index, None));
            }
        }
    }

    let timeout = args.timeout_ms.map(Duration::from_millis);
    let mut failed = 0;
    for (index, process) in &processes {
        let Some(process) = process else {
            failed += 1;
            continue;
        };
        let report = wait_for(process, timeout).await;
        let pid = process
            .pid()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        match report {
            Ok(outcome) => {
                if !matches!(outcome, SpawnOutcome::Exited(0)) {
                    failed += 1;
                }
                println!("{} {} {}", index, pid, outcome);
            }
            Err(e) => {
                failed += 1;
                println!("{} {} error({})", index, pid, e);
            }
        }
    }

    if backend.name() == "unix" {
        println!("peak {}", admission::global().peak());
    }

    if failed > 0 {
        bail!("{} of {} execution(s) did not exit 0", failed, args.count);
    }
    Ok(())
}

fn build_request(args: &Args) -> Result<ExecRequest> {
    let command = match &args.shell_line {
        Some(line) => Command::parse(line),
        None => Command::new(args.command.iter().cloned()),
    };
    if command.is_empty() {
        bail!("no command given");
    }

    let identity = Identity::from_raw(args.uid, args.gid).context("invalid identity")?;
    let mut request = ExecRequest::new(command).identity(identity);
    if let Some(path) = &args.stdout {
        request = request.stdout_to(path);
    }
    if let Some(path) = &args.stderr {
        request = request.stderr_to(path);
    }
    if let Some(path) = &args.stdin {
        request = request.stdin_from(path);
    }
    Ok(request)
}

async fn wait_for(
    process: &Arc<Process>,
    timeout: Option<Duration>,
) -> RuntimeResult<SpawnOutcome> {
    let Some(timeout) = timeout else {
        return process.wait_async().await;
    };
    match tokio::time::timeout(timeout, process.wait_async()).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} still running after {:?}, destroying", process.id(), timeout);
            // destroy blocks while the process is still queued for admission.
            let doomed = Arc::clone(process);
            tokio::task::spawn_blocking(move || doomed.destroy())
                .await
                .map_err(|e| RuntimeError::Io(std::io::Error::other(e)))??;
            process.wait_async().await
        }
    }
}

fn initialize_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "warn" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    Ok(())
}
