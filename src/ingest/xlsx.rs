//! xlsx decoding
//!
//! Uploads arrive base64 encoded, optionally as a `data:` URL.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use std::io::Cursor;

use super::tabular::{Cell, Sheet, TabularSnapshot};
use crate::types::MouError;

/// Decode a base64 upload, accepting a `data:...;base64,` prefix
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, MouError> {
    let payload = match encoded.split_once("base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| MouError::MalformedSnapshot(format!("invalid base64: {}", e)))
}

/// Read every worksheet of an xlsx workbook
///
/// The first row of each sheet is its header. Empty sheets are skipped.
pub fn read_xlsx(bytes: Vec<u8>) -> Result<TabularSnapshot, MouError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))
        .map_err(|e| MouError::MalformedSnapshot(format!("not an xlsx workbook: {}", e)))?;

    let mut snapshot = TabularSnapshot::default();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| MouError::MalformedSnapshot(format!("sheet '{}': {}", name, e)))?;

        let mut rows = range.rows();
        let Some(header) = rows.next() else {
            continue;
        };
        let header = header
            .iter()
            .map(|c| to_cell(c).text().unwrap_or_default())
            .collect();
        let rows = rows
            .map(|row| row.iter().map(to_cell).collect())
            .collect();

        snapshot.sheets.push(Sheet { name, header, rows });
    }

    if snapshot.sheets.is_empty() {
        return Err(MouError::MalformedSnapshot("workbook has no data".into()));
    }
    Ok(snapshot)
}

fn to_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => Cell::Text(s.clone()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(dt) => Cell::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(e) => Cell::Text(format!("#{}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_variants() {
        let plain = STANDARD.encode(b"xlsx bytes");
        assert_eq!(decode_base64(&plain).unwrap(), b"xlsx bytes");

        let url = format!(
            "data:application/vnd.openxmlformats-officedocument.spreadsheetml.sheet;base64,{}",
            plain
        );
        assert_eq!(decode_base64(&url).unwrap(), b"xlsx bytes");

        assert!(matches!(
            decode_base64("***"),
            Err(MouError::MalformedSnapshot(_))
        ));
    }

    #[test]
    fn test_garbage_is_not_a_workbook() {
        assert!(matches!(
            read_xlsx(b"definitely not a zip".to_vec()),
            Err(MouError::MalformedSnapshot(_))
        ));
    }

    #[test]
    fn test_cell_conversion() {
        assert_eq!(to_cell(&Data::Int(3)), Cell::Number(3.0));
        assert_eq!(to_cell(&Data::String("DESY".into())), Cell::Text("DESY".into()));
        assert_eq!(to_cell(&Data::Empty), Cell::Empty);
    }
}
