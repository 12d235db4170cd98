use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use vin_enrich_lib::{parse_csv_keys, write_table_csv, AppConfig, AppState};

/// Decode the VINs in a CSV file and append manufacturer, make, model, type, class and GVWR.
#[derive(Debug, Parser)]
#[command(name = "vin-enrich", version)]
struct Cli {
    /// CSV file with `VIN` and `Year` columns; stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Where to write the enriched CSV; stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pause between lookups in milliseconds.
    #[arg(long)]
    throttle_ms: Option<u64>,

    /// Base URL of the decode service.
    #[arg(long)]
    endpoint: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(delay) = cli.throttle_ms {
        config = config.with_throttle_delay_ms(delay);
    }
    if let Some(endpoint) = cli.endpoint {
        config = config.with_lookup_endpoint(endpoint);
    }

    let state = AppState::initialize(config).context("failed to start lookup queue")?;

    let rows = match &cli.input {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            parse_csv_keys(BufReader::new(file))?
        }
        None => parse_csv_keys(io::stdin().lock())?,
    };

    let queued = state.load_and_enqueue(rows)?;
    info!(queued, "waiting for vin lookups");

    tokio::select! {
        _ = state.wait_idle() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            state.handler().shutdown();
            info!("interrupted; writing partial results");
        }
    }

    let snapshot = state.table().snapshot();
    match &cli.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            write_table_csv(BufWriter::new(file), &snapshot)?;
        }
        None => write_table_csv(io::stdout().lock(), &snapshot)?,
    }
    Ok(())
}
