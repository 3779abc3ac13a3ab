use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use hexstat::database::RunStatus;
use hexstat::lens::archive::{DownloadProgress, DownloadProgressCallback};
use hexstat::lens::ingest::{IngestPipeline, IngestProgress, IngestProgressCallback};
use hexstat::lens::time::{Period, TimeLens};
use hexstat::lens::utils::OutputFormat;
use hexstat::{format_size, HexstatConfig};
use indicatif::{ProgressBar, ProgressStyle};

use super::open_database;
use super::runs::print_runs;

/// Arguments for the Ingest command
#[derive(Args)]
pub struct IngestArgs {
    /// Month to ingest, YYYY-MM
    pub period: String,

    /// Parse and count records without writing them
    #[clap(long)]
    pub dry_run: bool,

    /// Ingest every month from PERIOD through this one, YYYY-MM
    #[clap(long, conflicts_with = "url")]
    pub through: Option<String>,

    /// Archive URL to fetch instead of the configured template
    #[clap(long)]
    pub url: Option<String>,

    /// Do not show the progress spinner
    #[clap(long)]
    pub no_progress: bool,
}

pub fn run(config: &HexstatConfig, args: IngestArgs, output_format: OutputFormat) {
    let IngestArgs {
        period,
        dry_run,
        through,
        url,
        no_progress,
    } = args;

    let periods = match through {
        Some(last) => match expand(&period, &last) {
            Ok(periods) => periods,
            Err(e) => {
                eprintln!("ERROR: {}", e);
                std::process::exit(1);
            }
        },
        None => vec![period.clone()],
    };

    let db = open_database(config);

    let pb = if no_progress {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} [{elapsed}] {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("preparing {}", period));
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    };

    let ingest_pb = pb.clone();
    let on_ingest: IngestProgressCallback = Arc::new(move |event| match event {
        IngestProgress::Started { run_id, period } => {
            ingest_pb.set_message(format!("run {} started for {}", run_id, period));
        }
        IngestProgress::Downloaded { bytes, .. } => {
            ingest_pb.set_message(format!("downloaded {}, parsing", format_size(bytes)));
        }
        IngestProgress::BatchFlushed { total_inserted, .. } => {
            ingest_pb.set_message(format!("{} records inserted", total_inserted));
        }
        IngestProgress::Completed { run } | IngestProgress::Failed { run } => {
            ingest_pb.set_message(format!("run {} {}", run.id, run.status));
        }
    });

    let download_pb = pb.clone();
    let on_download: DownloadProgressCallback = Arc::new(move |event| match event {
        DownloadProgress::Received {
            bytes,
            total: Some(total),
        } => download_pb.set_message(format!(
            "downloading {} / {}",
            format_size(bytes),
            format_size(total)
        )),
        DownloadProgress::Received { bytes, total: None } => {
            download_pb.set_message(format!("downloading {}", format_size(bytes)));
        }
        DownloadProgress::Resuming { offset } => {
            download_pb.set_message(format!("resuming from {}", format_size(offset)));
        }
        DownloadProgress::Retrying {
            attempt, delay, ..
        } => download_pb.set_message(format!(
            "retrying download (attempt {}) in {:.1}s",
            attempt,
            delay.as_secs_f64()
        )),
        _ => {}
    });

    let pipeline = IngestPipeline::new(&db, config)
        .with_progress(on_ingest)
        .with_download_progress(on_download);

    let mut runs = Vec::with_capacity(periods.len());
    for period in &periods {
        let result = match &url {
            Some(url) => pipeline.ingest_from_url(period, url, dry_run),
            None => pipeline.ingest(period, dry_run),
        };
        match result {
            Ok(run) => runs.push(run),
            Err(e) => {
                pb.finish_and_clear();
                print_runs(&runs, output_format);
                eprintln!("ERROR: {}", e);
                std::process::exit(1);
            }
        }
    }
    pb.finish_and_clear();

    print_runs(&runs, output_format);
    if runs.iter().any(|run| run.status == RunStatus::Failed) {
        std::process::exit(1);
    }
}

fn expand(first: &str, last: &str) -> anyhow::Result<Vec<String>> {
    let from: Period = first.parse()?;
    let to: Period = last.parse()?;
    let periods = TimeLens::new().expand_periods(from, to)?;
    Ok(periods.iter().map(Period::to_string).collect())
}
