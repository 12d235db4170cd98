use std::io::{Read, Write};

use csv::{ReaderBuilder, Trim, WriterBuilder};

use crate::errors::AppResult;
use crate::table::{TableRow, COLUMN_HEADERS, IDENTIFIER_COLUMN, YEAR_COLUMN};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleKeys {
    pub identifier: Option<String>,
    pub year: Option<String>,
}

impl VehicleKeys {
    pub fn into_pair(self) -> (Option<String>, Option<String>) {
        (self.identifier, self.year)
    }
}

/// Reads VIN/year pairs from CSV with a header row.
///
/// Columns are located by header name (`VIN`, `Year`, case-insensitive) and
/// fall back to the first two columns when the headers are not recognised.
pub fn parse_csv_keys<R: Read>(reader: R) -> AppResult<Vec<VehicleKeys>> {
    let mut csv = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let headers = csv.headers()?.clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|header| header.eq_ignore_ascii_case(name))
    };
    let vin_idx = position("vin").unwrap_or(IDENTIFIER_COLUMN);
    let year_idx = position("year")
        .or_else(|| position("model year"))
        .unwrap_or(YEAR_COLUMN);

    let mut rows = Vec::new();
    for record in csv.records() {
        let record = record?;
        rows.push(VehicleKeys {
            identifier: non_empty(record.get(vin_idx)),
            year: non_empty(record.get(year_idx)),
        });
    }
    Ok(rows)
}

pub fn write_table_csv<W: Write>(writer: W, rows: &[TableRow]) -> AppResult<()> {
    let mut csv = WriterBuilder::new().from_writer(writer);
    csv.write_record(COLUMN_HEADERS)?;
    for row in rows {
        csv.write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))?;
    }
    csv.flush()?;
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
