use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use postgres::{Client, NoTls};
use tracing::{error, info};

use visitmon_service::error::SourceError;
use visitmon_service::ingest::csv_rows::parse_rows_csv;
use visitmon_service::ingest::database::{fetch_raw_rows, list_source_tables};
use visitmon_service::logging::{Stage, init_logging};
use visitmon_service::model::RawRow;
use visitmon_service::{ConfigError, Pipeline, PipelineConfig, PipelineError};

/// Analyze visit records: clean, flag outliers, label descriptions, report.
#[derive(Parser, Debug)]
#[command(name = "visitmon", version, about = "Temporal analysis of branch visit records")]
struct Cli {
    /// Path to the TOML configuration. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Read rows from a CSV export instead of the database
    #[arg(long, conflicts_with = "table")]
    input: Option<PathBuf>,

    /// Read rows from this table (overrides `[source] table`)
    #[arg(long)]
    table: Option<String>,

    /// List candidate source tables and exit
    #[arg(long)]
    list_tables: bool,

    /// Write the report CSV here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write the full run output (flags, vectors, diagnostics) as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    /// Write only the run diagnostics as JSON
    #[arg(long)]
    diagnostics: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, cli.log_file.as_deref()) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(stage = %Stage::System, "{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), PipelineError> {
    dotenv::dotenv().ok();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(table) = &cli.table {
        config.source.table = Some(table.clone());
    }

    if cli.list_tables {
        let mut client = connect()?;
        for table in list_source_tables(&mut client)? {
            println!("{table}");
        }
        return Ok(());
    }

    // Validate before touching any input.
    let pipeline = Pipeline::from_config(config)?;
    let rows = load_rows(&cli, pipeline.config())?;
    let output = pipeline.run(&rows);

    let csv = output.summary.to_csv();
    match &cli.output {
        Some(path) => {
            fs::write(path, csv)?;
            info!(stage = %Stage::Report, path = %path.display(), rows = output.summary.rows.len(), "report written");
        }
        None => print!("{csv}"),
    }
    if let Some(path) = &cli.json {
        fs::write(path, serde_json::to_string_pretty(&output)?)?;
    }
    if let Some(path) = &cli.diagnostics {
        fs::write(path, serde_json::to_string_pretty(&output.diagnostics)?)?;
    }
    Ok(())
}

fn load_rows(cli: &Cli, config: &PipelineConfig) -> Result<Vec<RawRow>, PipelineError> {
    if let Some(path) = &cli.input {
        let text = fs::read_to_string(path).map_err(SourceError::from)?;
        let rows = parse_rows_csv(&text, &config.source.columns)?;
        info!(stage = %Stage::Normalize, path = %path.display(), rows = rows.len(), "loaded CSV rows");
        return Ok(rows);
    }
    let mut client = connect()?;
    Ok(fetch_raw_rows(&mut client, &config.source)?)
}

fn connect() -> Result<Client, PipelineError> {
    let url = std::env::var("DATABASE_URL")
        .map_err(|_| ConfigError::invalid("DATABASE_URL", "must be set to read from the database"))?;
    Client::connect(&url, NoTls).map_err(|e| PipelineError::Source(SourceError::from(e)))
}
