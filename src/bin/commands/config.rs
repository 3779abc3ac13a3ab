use clap::Args;
use hexstat::database::{HexstatDatabase, SchemaManager, SchemaStatus, SCHEMA_VERSION};
use hexstat::lens::utils::OutputFormat;
use hexstat::{format_size, HexstatConfig};
use serde::Serialize;
use std::path::Path;

use super::print_json;

/// Arguments for the Config command
#[derive(Args)]
pub struct ConfigArgs {
    /// Also list leftover archive files in the archive directory
    #[clap(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Serialize)]
struct ConfigInfo {
    config_file: String,
    data_dir: String,
    archive_url_template: String,
    batch_size: usize,
    confidence_level: f64,
    download: DownloadInfo,
    database: DatabaseInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    archives: Option<Vec<FileInfo>>,
}

#[derive(Debug, Serialize)]
struct DownloadInfo {
    attempts: u32,
    retry_base_ms: u64,
    probe_timeout_secs: u64,
    transfer_timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct DatabaseInfo {
    path: String,
    exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
    schema_initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aggregate_generation: Option<u64>,
}

#[derive(Debug, Serialize)]
struct FileInfo {
    name: String,
    size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    modified: Option<String>,
}

pub fn run(config: &HexstatConfig, args: ConfigArgs, output_format: OutputFormat) {
    let ConfigArgs { verbose } = args;

    let sqlite_path = config.sqlite_path();
    let sqlite_exists = Path::new(&sqlite_path).exists();
    let size_bytes = if sqlite_exists {
        std::fs::metadata(&sqlite_path).ok().map(|m| m.len())
    } else {
        None
    };

    // Only inspect an existing file; opening would create it
    let (schema_initialized, schema_version, record_count, aggregate_generation) =
        if sqlite_exists {
            match HexstatDatabase::open(&sqlite_path) {
                Ok(db) => {
                    let version = match SchemaManager::new(db.connection()).check_status() {
                        Ok(SchemaStatus::Current) => Some(SCHEMA_VERSION),
                        Ok(SchemaStatus::NeedsMigration { from, .. }) => Some(from),
                        Ok(SchemaStatus::Incompatible {
                            database_version, ..
                        }) => Some(database_version),
                        _ => None,
                    };
                    (
                        version.is_some(),
                        version,
                        db.records().count().ok(),
                        db.aggregate_generation().ok(),
                    )
                }
                Err(_) => (false, None, None, None),
            }
        } else {
            (false, None, None, None)
        };

    let archives = verbose.then(|| list_archives(&config.archive_dir()));

    let info = ConfigInfo {
        config_file: HexstatConfig::config_file_path(),
        data_dir: config.data_dir.clone(),
        archive_url_template: config.archive_url_template.clone(),
        batch_size: config.batch_size,
        confidence_level: config.confidence_level,
        download: DownloadInfo {
            attempts: config.download_attempts,
            retry_base_ms: config.retry_base_ms,
            probe_timeout_secs: config.probe_timeout_secs,
            transfer_timeout_secs: config.transfer_timeout_secs,
        },
        database: DatabaseInfo {
            path: sqlite_path,
            exists: sqlite_exists,
            size_bytes,
            schema_initialized,
            schema_version,
            record_count,
            aggregate_generation,
        },
        archives,
    };

    match output_format {
        OutputFormat::Json | OutputFormat::JsonLine => print_json(&info, false),
        OutputFormat::JsonPretty => print_json(&info, true),
        _ => print_config_text(config, &info),
    }
}

fn list_archives(dir: &str) -> Vec<FileInfo> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().ok().map(|t| {
                let datetime: chrono::DateTime<chrono::Utc> = t.into();
                datetime.format("%Y-%m-%d %H:%M:%S UTC").to_string()
            });
            files.push(FileInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                size_bytes: metadata.len(),
                modified,
            });
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}

fn print_config_text(config: &HexstatConfig, info: &ConfigInfo) {
    println!("Hexstat Configuration");
    println!("=====================\n");

    println!("Config file:        {}", info.config_file);
    println!("{}", config.summary());
    println!();

    println!("SQLite Database:");
    println!("  Path:           {}", info.database.path);
    println!(
        "  Status:         {}",
        if info.database.exists {
            "exists"
        } else {
            "not created"
        }
    );
    if let Some(size) = info.database.size_bytes {
        println!("  Size:           {}", format_size(size));
    }
    println!(
        "  Schema:         {}",
        match info.database.schema_version {
            Some(v) => format!("initialized (v{})", v),
            None => "not initialized".to_string(),
        }
    );
    if let Some(count) = info.database.record_count {
        println!("  Records:        {}", count);
    }
    if let Some(generation) = info.database.aggregate_generation {
        println!("  Generation:     {}", generation);
    }

    if let Some(ref files) = info.archives {
        println!();
        println!("Archive Files:");
        if files.is_empty() {
            println!("  (none)");
        }
        for file in files {
            println!(
                "  {:<40} {:>12}  {}",
                file.name,
                format_size(file.size_bytes),
                file.modified.as_deref().unwrap_or("-")
            );
        }
    }

    eprintln!();
    eprintln!("Tips:");
    eprintln!("  Use --verbose (-v) to list leftover archive downloads");
    eprintln!("  Use --format json for machine-readable output");
    eprintln!(
        "  Edit {} or set HEXSTAT_* variables to customize settings",
        info.config_file
    );
}
