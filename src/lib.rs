mod config;
mod diagnostics;
mod errors;
mod fetcher;
mod ingestion;
mod lookup;
mod observer;
mod requests;
mod table;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{AppConfig, DEFAULT_LOOKUP_ENDPOINT};
pub use diagnostics::{LookupDiagnostics, LookupFailure};
pub use errors::{AppError, AppResult};
pub use fetcher::{DrainPhase, FetchHandler};
pub use ingestion::{parse_csv_keys, write_table_csv, VehicleKeys};
pub use lookup::{HttpVehicleLookup, LookupQuery, LookupService, VehicleDetails, VehicleLookup};
pub use observer::{CellChange, ChangeSource, EditObserver};
pub use requests::{EditAction, KeyField, PendingSnapshot, RequestState};
pub use table::{
    clear_derived, MemoryTable, TableHandle, TableRow, COLUMN_COUNT, COLUMN_HEADERS,
    DERIVED_COLUMNS, IDENTIFIER_COLUMN, YEAR_COLUMN,
};

/// A lookup queue wired to an in-memory table.
pub struct AppState {
    config: AppConfig,
    table: Arc<MemoryTable>,
    observer: EditObserver,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let lookup = LookupService::new(&config)?;
        Self::with_lookup(config, lookup)
    }

    pub fn with_lookup(config: AppConfig, lookup: LookupService) -> AppResult<Self> {
        let diagnostics = LookupDiagnostics::new(&config)?;
        let handler = FetchHandler::new(&config, lookup, diagnostics)?;
        let table = Arc::new(MemoryTable::new());
        let observer = EditObserver::new(handler, table.clone());
        info!(
            endpoint = %config.lookup_endpoint,
            throttle_ms = config.throttle_delay_ms,
            "vin lookup queue ready"
        );
        Ok(Self {
            config,
            table,
            observer,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<MemoryTable> {
        &self.table
    }

    pub fn observer(&self) -> &EditObserver {
        &self.observer
    }

    pub fn handler(&self) -> &FetchHandler {
        self.observer.handler()
    }

    /// Loads rows without triggering lookups, then queues every row that has a VIN.
    pub fn load_and_enqueue(&self, rows: Vec<VehicleKeys>) -> AppResult<usize> {
        self.table.load_keys(rows.into_iter().map(VehicleKeys::into_pair));
        let snapshot = self.table.snapshot();
        let loaded: Vec<CellChange> = snapshot
            .iter()
            .enumerate()
            .map(|(row, cells)| {
                CellChange::new(row, IDENTIFIER_COLUMN, None, cells[IDENTIFIER_COLUMN].clone())
            })
            .collect();
        self.observer.after_change(&loaded, ChangeSource::LoadData)?;

        let edits: Vec<CellChange> = loaded
            .into_iter()
            .filter(|change| change.new.is_some())
            .collect();
        let queued = edits.len();
        self.observer.after_change(&edits, ChangeSource::Edit)?;
        Ok(queued)
    }

    pub async fn wait_idle(&self) {
        self.handler().wait_idle().await;
        let failures = self.handler().diagnostics().total_failures();
        if failures > 0 {
            warn!(failures, "some vin lookups failed; their rows were left blank");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,vin_enrich_lib=debug,vin_enrich=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
