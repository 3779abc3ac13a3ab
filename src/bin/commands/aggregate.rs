use hexstat::lens::aggregate::{AggregateArgs, AggregationEngine, CellSummary};
use hexstat::lens::utils::{
    format_categories, truncate_name, OutputFormat, DEFAULT_CATEGORIES_MAX_LEN,
};
use hexstat::HexstatConfig;
use serde_json::json;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::{open_database, print_json};

#[derive(Tabled)]
struct CellRow {
    cell: String,
    count: u64,
    categories: String,
    mean_risk: String,
    interval: String,
}

fn cell_row(cell: &str, summary: &CellSummary) -> CellRow {
    CellRow {
        cell: cell.to_string(),
        count: summary.count,
        categories: truncate_name(
            &format_categories(&summary.categories),
            DEFAULT_CATEGORIES_MAX_LEN,
        ),
        mean_risk: summary
            .statistics
            .mean_risk_score
            .map(|m| format!("{:.3}", m))
            .unwrap_or_else(|| "-".to_string()),
        interval: summary
            .statistics
            .confidence_interval
            .map(|ci| format!("[{:.3}, {:.3}] @ {}", ci.lower, ci.upper, ci.level))
            .unwrap_or_else(|| "-".to_string()),
    }
}

pub fn run(config: &HexstatConfig, args: AggregateArgs, output_format: OutputFormat) {
    let query = match args.to_query(config.confidence_level) {
        Ok(q) => q,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    let db = open_database(config);
    let cells = match AggregationEngine::new(&db).summarize_by_bbox(&query) {
        Ok(cells) => cells,
        Err(e) => {
            eprintln!("ERROR: Failed to aggregate records: {}", e);
            std::process::exit(1);
        }
    };

    if cells.is_empty() && output_format.is_table() {
        eprintln!("No records found in {}", query.bbox);
        return;
    }

    match output_format {
        OutputFormat::Table => {
            let rows: Vec<CellRow> = cells
                .iter()
                .map(|(cell, summary)| cell_row(cell.as_str(), summary))
                .collect();
            println!("{}", Table::new(rows).with(Style::rounded()));
        }
        OutputFormat::Markdown => {
            let rows: Vec<CellRow> = cells
                .iter()
                .map(|(cell, summary)| cell_row(cell.as_str(), summary))
                .collect();
            println!("{}", Table::new(rows).with(Style::markdown()));
        }
        OutputFormat::Json => print_json(&cells, false),
        OutputFormat::JsonPretty => print_json(&cells, true),
        OutputFormat::JsonLine => {
            for (cell, summary) in &cells {
                print_json(&json!({ "cell": cell, "summary": summary }), false);
            }
        }
        OutputFormat::Psv => {
            println!("cell|count|categories|mean_risk|ci_lower|ci_upper");
            for (cell, summary) in &cells {
                let (lower, upper) = summary
                    .statistics
                    .confidence_interval
                    .map(|ci| (ci.lower.to_string(), ci.upper.to_string()))
                    .unwrap_or_default();
                println!(
                    "{}|{}|{}|{}|{}|{}",
                    cell,
                    summary.count,
                    format_categories(&summary.categories),
                    summary
                        .statistics
                        .mean_risk_score
                        .map(|m| m.to_string())
                        .unwrap_or_default(),
                    lower,
                    upper
                );
            }
        }
    }
}
