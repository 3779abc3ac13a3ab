//! Fixtures shared by unit tests

use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;

/// Build an in-memory ZIP archive from `(name, content)` entries
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let raw: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(name, content)| (*name, content.as_bytes()))
        .collect();
    zip_bytes_raw(&raw)
}

/// Build an in-memory ZIP archive from raw byte entries
pub fn zip_bytes_raw(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A small street-level archive for one month
pub const STREET_CSV: &str = "\u{feff}Crime ID,Month,Reported by,Falls within,Longitude,Latitude,Location,LSOA code,LSOA name,Crime type,Last outcome category,Context
,2024-01,Metropolitan Police Service,Metropolitan Police Service,-0.127800,51.507400,On or near Trafalgar Square,E01004734,Westminster 018A,Burglary,Under investigation,
,2024-01,Metropolitan Police Service,Metropolitan Police Service,-0.127812,51.507391,On or near Strand,E01004734,Westminster 018A,Vehicle crime,Under investigation,
abc123,2024-01,Metropolitan Police Service,Metropolitan Police Service,-0.141900,51.501400,On or near Buckingham Gate,E01004736,Westminster 020B,Robbery,Status update unavailable,
";
