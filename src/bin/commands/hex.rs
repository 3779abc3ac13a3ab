use clap::Subcommand;
use hexstat::lens::hex::{HexBoundary, HexCellArgs, HexCellInfo, HexLens};
use hexstat::lens::utils::OutputFormat;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::print_json;

#[derive(Subcommand)]
pub enum HexCommands {
    /// Find the cell containing a coordinate
    Cell(HexCellArgs),

    /// Print the boundary vertices of a cell
    Boundary {
        /// Cell identifier, e.g. 88194ad30dfffff
        cell: String,

        /// Print a GeoJSON polygon instead of the vertex list
        #[clap(long)]
        geojson: bool,
    },
}

#[derive(Tabled)]
struct VertexRow {
    index: usize,
    lng: f64,
    lat: f64,
}

pub fn run(commands: HexCommands, output_format: OutputFormat) {
    let lens = HexLens::default();

    match commands {
        HexCommands::Cell(args) => match lens.cell(&args) {
            Ok(info) => print_cell(&info, output_format),
            Err(e) => {
                eprintln!("ERROR: {}", e);
                std::process::exit(1);
            }
        },
        HexCommands::Boundary { cell, geojson } => match lens.boundary(&cell) {
            Ok(boundary) if geojson => {
                print_json(&boundary.to_geojson(), output_format == OutputFormat::JsonPretty)
            }
            Ok(boundary) => print_boundary(&boundary, output_format),
            Err(e) => {
                eprintln!("ERROR: {}", e);
                std::process::exit(1);
            }
        },
    }
}

fn print_cell(info: &HexCellInfo, output_format: OutputFormat) {
    match output_format {
        OutputFormat::Table => println!("{}", Table::new([info]).with(Style::rounded())),
        OutputFormat::Markdown => println!("{}", Table::new([info]).with(Style::markdown())),
        OutputFormat::Json | OutputFormat::JsonLine => print_json(info, false),
        OutputFormat::JsonPretty => print_json(info, true),
        OutputFormat::Psv => {
            println!("cell|resolution|lat|lng");
            println!("{}|{}|{}|{}", info.cell, info.resolution, info.lat, info.lng);
        }
    }
}

fn print_boundary(boundary: &HexBoundary, output_format: OutputFormat) {
    let rows: Vec<VertexRow> = boundary
        .vertices
        .iter()
        .enumerate()
        .map(|(index, [lng, lat])| VertexRow {
            index,
            lng: *lng,
            lat: *lat,
        })
        .collect();

    match output_format {
        OutputFormat::Table => println!("{}", Table::new(rows).with(Style::rounded())),
        OutputFormat::Markdown => println!("{}", Table::new(rows).with(Style::markdown())),
        OutputFormat::Json | OutputFormat::JsonLine => print_json(boundary, false),
        OutputFormat::JsonPretty => print_json(boundary, true),
        OutputFormat::Psv => {
            println!("index|lng|lat");
            for row in rows {
                println!("{}|{}|{}", row.index, row.lng, row.lat);
            }
        }
    }
}
