use anyhow::Context;
use clap::{Parser, Subcommand};
use simplecmd_core::{ExecutionResult, Outcome};
use simplecmd_runner::ProcessRunner;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use tracing::debug;

mod config;

use config::{FileConfig, OutputFormat, Overrides, RunSettings, CONFIG_TEMPLATE};

/// Exit status used when the command was killed after its timeout.
const EXIT_TIMEOUT: i32 = 124;
/// Exit status used when the command could not be started.
const EXIT_SPAWN_FAILED: i32 = 127;

#[derive(Parser)]
#[command(name = "simplecmd")]
#[command(about = "Run a command with a timeout and capture its output", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML file with default settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command
    Run {
        /// Kill the command after this many seconds (0 or less disables the bound)
        #[arg(short, long, allow_negative_numbers = true)]
        timeout: Option<i64>,

        /// Kill the command after this many milliseconds
        #[arg(long, conflicts_with = "timeout")]
        timeout_ms: Option<u64>,

        /// Mirror output to the terminal while the command runs
        #[arg(short, long)]
        live: bool,

        /// How to print the result
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,

        /// Directory to run the command in
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment variable for the command (KEY=VALUE, repeatable)
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Program to run
        program: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Generate a config file template
    Init {
        /// Where to write the template
        #[arg(short, long, default_value = "simplecmd.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => {
            generate_config_template(&path)?;
        }
        Commands::Run {
            timeout,
            timeout_ms,
            live,
            format,
            cwd,
            env,
            program,
            args,
        } => {
            let file = match &cli.config {
                Some(path) => FileConfig::load(path)
                    .with_context(|| format!("Failed to load config at {}", path.display()))?,
                None => FileConfig::default(),
            };
            let overrides = Overrides {
                timeout_secs: timeout,
                timeout_ms,
                live,
                format,
                working_dir: cwd,
                env,
            };
            let settings = config::resolve(file, overrides, program, args)?;
            let code = run_command(settings).await?;
            process::exit(code);
        }
    }

    Ok(())
}

async fn run_command(settings: RunSettings) -> anyhow::Result<i32> {
    let RunSettings { spec, live, format } = settings;
    let runner = ProcessRunner::from_spec(spec);

    let result = if live {
        runner.run_with_output().await
    } else {
        runner.run().await
    };

    debug!(
        execution_id = %result.id,
        status = %result.status(),
        exit_code = result.exit_code(),
        duration_ms = result.duration_ms,
        "Command finished"
    );

    print_result(&result, format, live)?;
    report_failure(&result);

    Ok(exit_status(&result))
}

fn print_result(result: &ExecutionResult, format: OutputFormat, live: bool) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    match format {
        // Live mode already mirrored the output as it was produced.
        OutputFormat::Plain if live => {}
        OutputFormat::Plain => write!(stdout, "{}", result.output())?,
        OutputFormat::Summary => write!(stdout, "{}", result)?,
        OutputFormat::Json => writeln!(stdout, "{}", result.to_json()?)?,
    }
    stdout.flush()?;
    Ok(())
}

fn report_failure(result: &ExecutionResult) {
    match result.outcome {
        Outcome::TimedOut => {
            eprintln!("simplecmd: command timed out and was killed");
            if let Some(err) = result.error() {
                eprintln!("simplecmd: {}", err);
            }
        }
        Outcome::SpawnFailed | Outcome::WaitFailed | Outcome::Signaled(_) => {
            if let Some(err) = result.error() {
                eprintln!("simplecmd: {}", err);
            }
        }
        Outcome::Exited(_) => {}
    }
}

/// Exit status for this process, following the conventions of coreutils `timeout`.
fn exit_status(result: &ExecutionResult) -> i32 {
    match result.outcome {
        Outcome::Exited(code) => code,
        Outcome::TimedOut => EXIT_TIMEOUT,
        Outcome::SpawnFailed => EXIT_SPAWN_FAILED,
        Outcome::Signaled(signal) => 128 + signal,
        Outcome::WaitFailed => 1,
    }
}

fn generate_config_template(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        eprintln!("Error: config file already exists at {}", path.display());
        eprintln!("Use a different path or remove the existing file.");
        process::exit(1);
    }

    fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write config template to {}", path.display()))?;
    println!("Created config template at {}", path.display());
    Ok(())
}
