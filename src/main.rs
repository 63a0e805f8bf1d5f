use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

use annotee::config::AnnoteeConfig;
use annotee::executor::{AnnotationMode, ExecutionResult, Executor};
use annotee::logging::init_logging;
use annotee::processor::ProcessorOptions;
use annotee::stream::FilesystemClient;

/// Returned when annotee itself is misconfigured
const CONFIG_ERROR_EXIT_CODE: i32 = 2;

/// Returned when annotee fails while running the command; chosen to be
/// unlikely to collide with the command's own exit codes
const RUNTIME_ERROR_EXIT_CODE: i32 = 251;

/// Run a command and translate the annotations in its output into step streams
#[derive(Parser, Debug)]
#[command(name = "annotee", version)]
struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Annotation handling mode
    #[arg(long, value_enum, default_value_t = AnnotationMode::Tee)]
    annotate: AnnotationMode,

    /// Directory receiving every generated stream
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Naming base for generated streams (overrides the config file)
    #[arg(long)]
    base: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON file holding the full command as an array of strings
    #[arg(long)]
    json_args_path: Option<PathBuf>,

    /// Do not copy the command's stdout/stderr to our own
    #[arg(long)]
    no_tee: bool,

    /// Print the final state of every step when done
    #[arg(long)]
    print_summary: bool,

    /// Command to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let (config, command) = match prepare(&cli).await {
        Ok(prepared) => prepared,
        Err(e) => {
            init_logging(cli.verbose, None);
            error!("Invalid configuration: {:#}", e);
            eprintln!("Error: {e:#}");
            return CONFIG_ERROR_EXIT_CODE;
        }
    };
    init_logging(cli.verbose, config.log_level.as_deref());
    debug!(?config, ?command, "Configuration loaded");

    match execute(&cli, &config, command).await {
        Ok(result) => {
            if cli.print_summary {
                print_summary(&result);
            }
            result.exit_code.unwrap_or(RUNTIME_ERROR_EXIT_CODE)
        }
        Err(e) => {
            error!("Failed during execution: {:#}", e);
            eprintln!("Error: {e:#}");
            RUNTIME_ERROR_EXIT_CODE
        }
    }
}

async fn prepare(cli: &Cli) -> Result<(AnnoteeConfig, Vec<String>)> {
    let mut config = match &cli.config {
        Some(path) => AnnoteeConfig::load(path).await?,
        None => AnnoteeConfig::default(),
    };
    config.merge_env_vars();
    if let Some(base) = &cli.base {
        config.base = base.clone();
    }
    config.validate()?;

    let command = match &cli.json_args_path {
        Some(_) if !cli.command.is_empty() => {
            bail!("Cannot specify both JSON and command-line arguments")
        }
        Some(path) => load_json_args(path).await?,
        None => cli.command.clone(),
    };
    if command.is_empty() {
        bail!("No command-line arguments were supplied");
    }
    Ok((config, command))
}

async fn load_json_args(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read JSON arguments from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON arguments in {}", path.display()))
}

async fn execute(
    cli: &Cli,
    config: &AnnoteeConfig,
    command: Vec<String>,
) -> Result<ExecutionResult> {
    tokio::fs::create_dir_all(&cli.output_dir)
        .await
        .with_context(|| format!("Failed to create {}", cli.output_dir.display()))?;

    let client = FilesystemClient::new(&cli.output_dir);
    let mut options = ProcessorOptions::new(config.base_name()?, Arc::new(client));
    options.link_generator = config.link_generator();
    options.meter = config.metering;

    Executor::new(command, options)
        .annotate(cli.annotate)
        .tee(!cli.no_tee)
        .buffer_size(config.buffer_size)
        .run()
        .await
}

fn print_summary(result: &ExecutionResult) {
    for step in &result.snapshot.steps {
        println!("=== annotee: {:?} ===", step.name);
        match serde_json::to_string_pretty(step) {
            Ok(json) => println!("{json}"),
            Err(e) => error!(step = %step.canonical_name, error = %e, "Failed to render step"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn test_cli_parses_trailing_command() {
        let cli = Cli::parse_from([
            "annotee",
            "--output-dir",
            "/tmp/out",
            "--annotate",
            "strip",
            "-vv",
            "make",
            "-j8",
            "all",
        ]);
        assert_eq!(cli.annotate, AnnotationMode::Strip);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.command, vec!["make", "-j8", "all"]);
    }

    #[tokio::test]
    async fn test_json_args_conflict_with_command() {
        let cli = Cli::parse_from([
            "annotee",
            "-o",
            "/tmp/out",
            "--json-args-path",
            "/tmp/args.json",
            "make",
        ]);
        let err = prepare(&cli).await.unwrap_err();
        assert!(err.to_string().contains("Cannot specify both"));
    }

    #[tokio::test]
    async fn test_json_args_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("args.json");
        std::fs::write(&path, r#"["echo", "hello world"]"#).unwrap();

        let cli = Cli::parse_from([
            OsString::from("annotee"),
            OsString::from("-o"),
            dir.path().as_os_str().to_os_string(),
            OsString::from("--json-args-path"),
            path.clone().into_os_string(),
        ]);
        let (_, command) = prepare(&cli).await.unwrap();
        assert_eq!(command, vec!["echo", "hello world"]);
    }

    #[tokio::test]
    async fn test_missing_command_is_rejected() {
        let cli = Cli::parse_from(["annotee", "-o", "/tmp/out"]);
        assert!(prepare(&cli).await.is_err());
    }
}
