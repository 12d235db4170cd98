use std::ops::Range;

use parking_lot::Mutex;

pub const IDENTIFIER_COLUMN: usize = 0;
pub const YEAR_COLUMN: usize = 1;
pub const DERIVED_COLUMNS: Range<usize> = 2..8;
pub const COLUMN_COUNT: usize = 8;

pub const COLUMN_HEADERS: [&str; COLUMN_COUNT] = [
    "VIN",
    "Year",
    "Manufacturer",
    "Make",
    "Model",
    "Type",
    "Class",
    "GVWR",
];

/// Cell-level access to the table the lookup results are written into.
///
/// Implementations are shared with the drain loop, so mutation goes through
/// `&self`. The engine never holds its own locks while calling these methods.
pub trait TableHandle: Send + Sync {
    fn cell(&self, row: usize, col: usize) -> Option<String>;

    fn set_cell(&self, row: usize, col: usize, value: Option<String>);

    fn trim_trailing_empty_rows(&self) {}
}

pub fn clear_derived(table: Option<&dyn TableHandle>, row: usize) {
    let Some(table) = table else {
        return;
    };
    for col in DERIVED_COLUMNS {
        table.set_cell(row, col, None);
    }
}

pub type TableRow = [Option<String>; COLUMN_COUNT];

#[derive(Default)]
pub struct MemoryTable {
    rows: Mutex<Vec<TableRow>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the table contents with `(identifier, year)` pairs and blank derived cells.
    pub fn load_keys<I>(&self, keys: I)
    where
        I: IntoIterator<Item = (Option<String>, Option<String>)>,
    {
        let loaded = keys
            .into_iter()
            .map(|(identifier, year)| {
                let mut row = TableRow::default();
                row[IDENTIFIER_COLUMN] = normalize(identifier);
                row[YEAR_COLUMN] = normalize(year);
                row
            })
            .collect();
        *self.rows.lock() = loaded;
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn row(&self, row: usize) -> Option<TableRow> {
        self.rows.lock().get(row).cloned()
    }

    pub fn snapshot(&self) -> Vec<TableRow> {
        self.rows.lock().clone()
    }
}

impl TableHandle for MemoryTable {
    fn cell(&self, row: usize, col: usize) -> Option<String> {
        self.rows
            .lock()
            .get(row)
            .and_then(|cells| cells.get(col).cloned().flatten())
    }

    fn set_cell(&self, row: usize, col: usize, value: Option<String>) {
        if col >= COLUMN_COUNT {
            return;
        }
        let mut rows = self.rows.lock();
        if rows.len() <= row {
            rows.resize_with(row + 1, TableRow::default);
        }
        rows[row][col] = normalize(value);
    }

    fn trim_trailing_empty_rows(&self) {
        let mut rows = self.rows.lock();
        let keep = rows
            .iter()
            .rposition(|cells| {
                cells[IDENTIFIER_COLUMN].is_some() || cells[YEAR_COLUMN].is_some()
            })
            .map(|idx| idx + 1)
            .unwrap_or(0);
        rows.truncate(keep);
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
