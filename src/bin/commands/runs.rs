use clap::Args;
use hexstat::database::{format_timestamp, IngestionRun};
use hexstat::lens::utils::OutputFormat;
use hexstat::HexstatConfig;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::{open_database, print_json};

/// Arguments for the Runs command
#[derive(Args)]
pub struct RunsArgs {
    /// Show at most this many runs, newest first
    #[clap(short, long, default_value_t = 20)]
    pub limit: usize,

    /// Only show the latest run for this period (YYYY-MM)
    #[clap(short, long)]
    pub period: Option<String>,

    /// Show a single run by id
    #[clap(long)]
    pub id: Option<i64>,
}

#[derive(Tabled)]
struct RunRow {
    id: i64,
    period: String,
    status: String,
    dry_run: bool,
    detected: u64,
    inserted: u64,
    existing: u64,
    duplicate: u64,
    invalid: u64,
    finished: String,
    error: String,
}

impl From<&IngestionRun> for RunRow {
    fn from(run: &IngestionRun) -> Self {
        let error = match (&run.error_kind, &run.error_message) {
            (Some(kind), Some(message)) => format!("{}: {}", kind.as_str(), message),
            (Some(kind), None) => kind.as_str().to_string(),
            (None, Some(message)) => message.clone(),
            (None, None) => String::new(),
        };
        RunRow {
            id: run.id,
            period: run.month.clone(),
            status: run.status.to_string(),
            dry_run: run.dry_run,
            detected: run.counters.records_detected,
            inserted: run.counters.records_inserted,
            existing: run.counters.records_existing,
            duplicate: run.counters.records_duplicate,
            invalid: run.counters.records_invalid,
            finished: run
                .finished_at
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_default(),
            error,
        }
    }
}

pub fn run(config: &HexstatConfig, args: RunsArgs, output_format: OutputFormat) {
    let RunsArgs { limit, period, id } = args;

    let db = open_database(config);
    let repo = db.runs();

    let result = match (id, period) {
        (Some(id), _) => repo.get(id).map(|r| r.into_iter().collect::<Vec<_>>()),
        (None, Some(period)) => repo
            .latest_for_period(&period)
            .map(|r| r.into_iter().collect::<Vec<_>>()),
        (None, None) => repo.recent(limit),
    };

    match result {
        Ok(runs) => {
            if runs.is_empty() && output_format.is_table() {
                eprintln!("No ingestion runs found");
                return;
            }
            print_runs(&runs, output_format);
        }
        Err(e) => eprintln!("ERROR: Failed to load ingestion runs: {}", e),
    }
}

/// Render runs in the requested format
pub(crate) fn print_runs(runs: &[IngestionRun], output_format: OutputFormat) {
    match output_format {
        OutputFormat::Table => {
            let rows: Vec<RunRow> = runs.iter().map(RunRow::from).collect();
            println!("{}", Table::new(rows).with(Style::rounded()));
        }
        OutputFormat::Markdown => {
            let rows: Vec<RunRow> = runs.iter().map(RunRow::from).collect();
            println!("{}", Table::new(rows).with(Style::markdown()));
        }
        OutputFormat::Json => print_json(&runs, false),
        OutputFormat::JsonPretty => print_json(&runs, true),
        OutputFormat::JsonLine => {
            for run in runs {
                print_json(run, false);
            }
        }
        OutputFormat::Psv => {
            println!("id|period|status|dry_run|detected|inserted|existing|duplicate|invalid|finished|error");
            for run in runs {
                let row = RunRow::from(run);
                println!(
                    "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
                    row.id,
                    row.period,
                    row.status,
                    row.dry_run,
                    row.detected,
                    row.inserted,
                    row.existing,
                    row.duplicate,
                    row.invalid,
                    row.finished,
                    row.error
                );
            }
        }
    }
}
