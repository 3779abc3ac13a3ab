pub mod aggregate;
pub mod config;
pub mod hex;
pub mod ingest;
pub mod runs;

use hexstat::database::HexstatDatabase;
use hexstat::HexstatConfig;

/// Open the configured database or exit with an error
pub(crate) fn open_database(config: &HexstatConfig) -> HexstatDatabase {
    match HexstatDatabase::open(&config.sqlite_path()) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("ERROR: Failed to open database: {}", e);
            std::process::exit(1);
        }
    }
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("ERROR: Failed to serialize output: {}", e),
    }
}
