use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;

use venue_footprints::ingestion::{parse_kml_records, read_csv_records};
use venue_footprints::{init_tracing, AppConfig, BatchJobCoordinator, JobStatus, VenueRecord};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputFormat {
    Csv,
    Kml,
}

/// Geocode a venue list and write venue/parking footprints as GeoJSON (and KML).
#[derive(Parser, Debug)]
#[command(name = "venue-footprints", version)]
struct Cli {
    /// CSV (`venue_name,address,city,state,zip[,date]`) or KML input file
    input: PathBuf,

    /// Input format; guessed from the file extension when omitted
    #[arg(long, value_enum)]
    format: Option<InputFormat>,

    /// Directory that receives `<job_id>/venues.geojson`
    #[arg(long, env = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Skip the KML sibling file
    #[arg(long)]
    no_kml: bool,

    /// Emit venue footprints only
    #[arg(long)]
    no_parking: bool,
}

impl Cli {
    fn input_format(&self) -> InputFormat {
        self.format.unwrap_or_else(|| {
            match self
                .input
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase)
                .as_deref()
            {
                Some("kml") => InputFormat::Kml,
                _ => InputFormat::Csv,
            }
        })
    }
}

fn load_records(cli: &Cli) -> anyhow::Result<Vec<VenueRecord>> {
    let bytes = std::fs::read(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let records = match cli.input_format() {
        InputFormat::Csv => read_csv_records(bytes.as_slice()),
        InputFormat::Kml => parse_kml_records(&bytes),
    }
    .with_context(|| format!("failed to parse {}", cli.input.display()))?;
    Ok(records)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(output_dir) = &cli.output_dir {
        config.output_dir = output_dir.clone();
    }
    if cli.no_kml {
        config.emit_kml = false;
    }
    if cli.no_parking {
        config.include_parking = false;
    }
    info!(config = ?config.public_profile(), "configuration loaded");

    let records = load_records(&cli)?;
    let coordinator =
        BatchJobCoordinator::from_config(&config).context("failed to start geocoding pipeline")?;
    let job_id = coordinator.submit(records);

    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let snapshot = loop {
        tokio::select! {
            finished = coordinator.wait(&job_id) => break finished?,
            _ = ticker.tick() => {
                let status = coordinator.status(&job_id)?;
                info!(
                    job_id = %job_id,
                    progress = status.progress.round(),
                    processed = status.processed_count,
                    total = status.total_count,
                    "geocoding"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                coordinator.cancel(&job_id)?;
                info!(job_id = %job_id, "cancelling after in-flight lookups finish");
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(if snapshot.status == JobStatus::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
