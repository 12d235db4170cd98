use std::sync::Arc;

use tracing::{error, trace};

use crate::errors::AppResult;
use crate::fetcher::FetchHandler;
use crate::requests::{EditAction, KeyField};
use crate::table::{clear_derived, TableHandle, IDENTIFIER_COLUMN, YEAR_COLUMN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Edit,
    /// Programmatic bulk load; never triggers lookups.
    LoadData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellChange {
    pub row: usize,
    pub col: usize,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl CellChange {
    pub fn new(row: usize, col: usize, old: Option<String>, new: Option<String>) -> Self {
        Self { row, col, old, new }
    }
}

/// Routes key-column edits from the table into the lookup queue.
pub struct EditObserver {
    handler: FetchHandler,
    table: Arc<dyn TableHandle>,
}

impl EditObserver {
    pub fn new(handler: FetchHandler, table: Arc<dyn TableHandle>) -> Self {
        handler.set_instance(Some(Arc::clone(&table)));
        Self { handler, table }
    }

    pub fn handler(&self) -> &FetchHandler {
        &self.handler
    }

    /// Applies a batch of cell changes. Every change is processed even if an
    /// earlier one fails; the first error is returned.
    pub fn after_change(&self, changes: &[CellChange], source: ChangeSource) -> AppResult<()> {
        if source == ChangeSource::LoadData {
            trace!(count = changes.len(), "ignoring bulk load");
            return Ok(());
        }

        let mut first_error = None;
        for change in changes {
            if let Err(err) = self.apply(change) {
                error!(?err, row = change.row, col = change.col, "failed to route cell edit");
                first_error.get_or_insert(err);
            }
        }

        self.table.trim_trailing_empty_rows();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn apply(&self, change: &CellChange) -> AppResult<()> {
        let field = match change.col {
            IDENTIFIER_COLUMN => KeyField::Identifier,
            YEAR_COLUMN => KeyField::Year,
            _ => return Ok(()),
        };
        let old = present(change.old.as_deref());
        let new = present(change.new.as_deref());
        if old == new {
            return Ok(());
        }

        let row = change.row;
        let deleted = new.is_none();
        if self.handler.has_request(row) {
            let action = if deleted {
                EditAction::Deleted
            } else {
                EditAction::Changed
            };
            self.handler
                .update_request(row, field, action, new.map(str::to_string))?;
        } else {
            let identifier = match field {
                KeyField::Identifier => new.map(str::to_string),
                KeyField::Year => present_cell(&*self.table, row, IDENTIFIER_COLUMN),
            };
            if let Some(identifier) = identifier {
                let year = match field {
                    KeyField::Year => new.map(str::to_string),
                    KeyField::Identifier => present_cell(&*self.table, row, YEAR_COLUMN),
                };
                self.handler.add_request(row, identifier, year)?;
            }
        }

        if field == KeyField::Identifier && deleted {
            clear_derived(Some(&*self.table), row);
        }
        Ok(())
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn present_cell(table: &dyn TableHandle, row: usize, col: usize) -> Option<String> {
    present(table.cell(row, col).as_deref()).map(str::to_string)
}
