use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::AppConfig;
use crate::diagnostics::{LookupDiagnostics, LookupFailure};
use crate::errors::{AppError, AppResult};
use crate::lookup::{LookupQuery, LookupService, VehicleDetails};
use crate::requests::{
    ClaimedRequest, EditAction, KeyField, PendingRequests, PendingSnapshot, RequestStatus,
};
use crate::table::{clear_derived, TableHandle, DERIVED_COLUMNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    Idle,
    Draining,
}

/// Single-flight, throttled VIN lookup queue.
///
/// Rows are looked up one at a time in arrival order with a fixed pause
/// between requests. Edits to a row's key fields while its lookup is queued
/// are applied in place; edits while it is in flight cancel the call and put
/// the row back at the end of the queue with the merged values.
#[derive(Clone)]
pub struct FetchHandler {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<HandlerState>,
    lookup: LookupService,
    diagnostics: LookupDiagnostics,
    throttle_delay: Duration,
    placeholder: String,
    runtime: Handle,
    phase_tx: watch::Sender<DrainPhase>,
    shutdown: CancellationToken,
}

struct HandlerState {
    requests: PendingRequests,
    table: Option<Arc<dyn TableHandle>>,
    phase: DrainPhase,
}

enum UpdateFollowup {
    Nothing,
    Withdrawn(Option<Arc<dyn TableHandle>>),
    Restart(u64),
}

impl FetchHandler {
    /// Must be called from within a tokio runtime; the drain loop is spawned onto it.
    pub fn new(
        config: &AppConfig,
        lookup: LookupService,
        diagnostics: LookupDiagnostics,
    ) -> AppResult<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            AppError::Config(format!("fetch handler requires a tokio runtime: {err}"))
        })?;
        let (phase_tx, _) = watch::channel(DrainPhase::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HandlerState {
                    requests: PendingRequests::new(),
                    table: None,
                    phase: DrainPhase::Idle,
                }),
                lookup,
                diagnostics,
                throttle_delay: Duration::from_millis(config.throttle_delay_ms),
                placeholder: config.missing_value_placeholder.clone(),
                runtime,
                phase_tx,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn set_instance(&self, table: Option<Arc<dyn TableHandle>>) {
        let Some(table) = table else {
            return;
        };
        self.inner.state.lock().table = Some(table);
    }

    pub fn add_request(
        &self,
        row: usize,
        identifier: impl Into<String>,
        year: Option<String>,
    ) -> AppResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AppError::Shutdown);
        }
        let (table, start) = {
            let mut state = self.inner.state.lock();
            let generation = state.requests.insert(row, identifier.into(), year)?;
            debug!(row, generation, "vin lookup queued");
            let start = self.begin_drain_locked(&mut state);
            (state.table.clone(), start)
        };
        clear_derived(table.as_deref(), row);
        if start {
            self.spawn_drain();
        }
        Ok(())
    }

    pub fn update_request(
        &self,
        row: usize,
        field: KeyField,
        action: EditAction,
        value: Option<String>,
    ) -> AppResult<()> {
        let value = match action {
            EditAction::Deleted => None,
            EditAction::Changed => value.filter(|v| !v.trim().is_empty()),
        };

        let followup = {
            let mut state = self.inner.state.lock();
            let entry = state
                .requests
                .get_mut(row)
                .ok_or(AppError::NoSuchRequest(row))?;

            if field == KeyField::Identifier && value.is_none() {
                if let RequestStatus::InProgress { cancel, .. } = &entry.status {
                    cancel.cancel();
                }
                state.requests.remove(row);
                UpdateFollowup::Withdrawn(state.table.clone())
            } else {
                entry.set_field(field, value);
                let generation = entry.generation();
                match &mut entry.status {
                    RequestStatus::Queued => {
                        trace!(row, ?field, "queued lookup updated in place");
                        UpdateFollowup::Nothing
                    }
                    RequestStatus::InProgress {
                        cancel,
                        restart_scheduled,
                    } => {
                        cancel.cancel();
                        if *restart_scheduled {
                            UpdateFollowup::Nothing
                        } else {
                            *restart_scheduled = true;
                            UpdateFollowup::Restart(generation)
                        }
                    }
                }
            }
        };

        match followup {
            UpdateFollowup::Nothing => {}
            UpdateFollowup::Withdrawn(table) => {
                debug!(row, "vin lookup withdrawn after identifier was cleared");
                clear_derived(table.as_deref(), row);
            }
            UpdateFollowup::Restart(generation) => {
                debug!(row, generation, ?field, "in-flight vin lookup superseded");
                self.schedule_restart(row, generation);
            }
        }
        Ok(())
    }

    pub fn has_request(&self, row: usize) -> bool {
        self.inner.state.lock().requests.contains(row)
    }

    pub fn pending(&self, row: usize) -> Option<PendingSnapshot> {
        self.inner.state.lock().requests.snapshot(row)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().requests.len()
    }

    pub fn phase(&self) -> DrainPhase {
        self.inner.state.lock().phase
    }

    pub fn diagnostics(&self) -> &LookupDiagnostics {
        &self.inner.diagnostics
    }

    /// Resolves once the queue is empty and the drain loop has stopped, or after shutdown.
    pub async fn wait_idle(&self) {
        let mut phase_rx = self.inner.phase_tx.subscribe();
        loop {
            if self.inner.shutdown.is_cancelled() {
                return;
            }
            {
                let state = self.inner.state.lock();
                if state.phase == DrainPhase::Idle && state.requests.is_empty() {
                    return;
                }
            }
            tokio::select! {
                changed = phase_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.inner.shutdown.cancelled() => return,
            }
        }
    }

    /// Aborts the in-flight lookup and stops the drain loop. Further arrivals are rejected.
    pub fn shutdown(&self) {
        info!("shutting down vin lookup queue");
        self.inner.shutdown.cancel();
    }

    fn begin_drain_locked(&self, state: &mut HandlerState) -> bool {
        if state.phase == DrainPhase::Draining || self.inner.shutdown.is_cancelled() {
            return false;
        }
        state.phase = DrainPhase::Draining;
        self.inner.phase_tx.send_replace(DrainPhase::Draining);
        true
    }

    fn spawn_drain(&self) {
        let handler = self.clone();
        self.inner.runtime.spawn(async move {
            handler.drain().await;
        });
    }

    fn schedule_restart(&self, row: usize, generation: u64) {
        let handler = self.clone();
        self.inner.runtime.spawn(async move {
            // Let the in-flight completion observe its cancellation first.
            tokio::task::yield_now().await;
            handler.requeue_superseded(row, generation);
        });
    }

    fn requeue_superseded(&self, row: usize, generation: u64) {
        let (table, start) = {
            let mut state = self.inner.state.lock();
            let Some(fresh) = state.requests.requeue_superseded(row, generation) else {
                return;
            };
            debug!(row, stale = generation, generation = fresh, "superseded vin lookup requeued");
            let start = self.begin_drain_locked(&mut state);
            (state.table.clone(), start)
        };
        clear_derived(table.as_deref(), row);
        if start {
            self.spawn_drain();
        }
    }

    async fn drain(self) {
        let mut guard = DrainGuard {
            handler: &self,
            in_flight: None,
            finished: false,
        };
        debug!("vin lookup queue draining");

        loop {
            if self.inner.shutdown.is_cancelled() {
                break;
            }

            let claimed = {
                let mut state = self.inner.state.lock();
                match state.requests.claim_next(&self.inner.shutdown) {
                    Some(claimed) => claimed,
                    None => {
                        state.phase = DrainPhase::Idle;
                        self.inner.phase_tx.send_replace(DrainPhase::Idle);
                        guard.finished = true;
                        debug!("vin lookup queue idle");
                        return;
                    }
                }
            };
            trace!(row = claimed.row, generation = claimed.generation, "vin lookup claimed");

            guard.in_flight = Some((claimed.row, claimed.generation, claimed.query.clone()));
            let outcome = self
                .inner
                .lookup
                .lookup(&claimed.query, &claimed.cancel)
                .await;
            self.complete(claimed, outcome);
            guard.in_flight = None;

            tokio::select! {
                _ = sleep(self.inner.throttle_delay) => {}
                _ = self.inner.shutdown.cancelled() => {
                    debug!("vin lookup queue stopped by shutdown");
                    break;
                }
            }
        }
    }

    fn complete(&self, claimed: ClaimedRequest, outcome: AppResult<VehicleDetails>) {
        let ClaimedRequest {
            row,
            generation,
            query,
            cancel,
        } = claimed;

        let (table, deliver, requeued) = {
            let mut state = self.inner.state.lock();
            let requeued = state.requests.requeue_superseded(row, generation);
            if requeued.is_none() {
                state.requests.remove_if_generation(row, generation);
            }
            (state.table.clone(), !cancel.is_cancelled(), requeued)
        };

        if let Some(fresh) = requeued {
            debug!(row, stale = generation, generation = fresh, "superseded vin lookup requeued");
            clear_derived(table.as_deref(), row);
        }

        match outcome {
            Ok(details) if deliver => {
                let Some(table) = table else {
                    warn!(row, "vin lookup finished with no table attached; result dropped");
                    return;
                };
                let values = details.column_values(&self.inner.placeholder);
                for (col, value) in DERIVED_COLUMNS.zip(values) {
                    table.set_cell(row, col, Some(value));
                }
                debug!(row, generation, "vin lookup applied");
            }
            Ok(_) => trace!(row, generation, "discarding result of a cancelled vin lookup"),
            Err(err) if err.is_cancelled() || !deliver => {
                trace!(row, generation, "vin lookup cancelled")
            }
            Err(err) => {
                warn!(?err, row, identifier = %query.identifier, "vin lookup failed");
                if let Err(record_err) = self
                    .inner
                    .diagnostics
                    .record(LookupFailure::new(row, &query, &err))
                {
                    warn!(?record_err, "failed to record vin lookup failure");
                }
            }
        }
    }
}

/// Cleans up after a drain task that stops without reaching an empty queue.
///
/// The in-flight row is dropped (or requeued if an edit superseded it) and,
/// unless the handler is shutting down, a fresh drain task picks up the rows
/// still waiting.
struct DrainGuard<'a> {
    handler: &'a FetchHandler,
    in_flight: Option<(usize, u64, LookupQuery)>,
    finished: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let inner = &self.handler.inner;
        let (abandoned, rearm) = {
            let mut state = inner.state.lock();
            let mut abandoned = None;
            if let Some((row, generation, query)) = self.in_flight.take() {
                warn!(row, generation, "vin lookup abandoned by a stopped drain loop");
                if state.requests.requeue_superseded(row, generation).is_none()
                    && state.requests.remove_if_generation(row, generation).is_some()
                {
                    abandoned = Some((row, query));
                }
            }
            let rearm = !inner.shutdown.is_cancelled() && state.requests.has_queued();
            if !rearm {
                state.phase = DrainPhase::Idle;
                inner.phase_tx.send_replace(DrainPhase::Idle);
            }
            (abandoned, rearm)
        };

        if let Some((row, query)) = abandoned.filter(|_| !inner.shutdown.is_cancelled()) {
            let err = AppError::lookup_failed(None, "lookup stopped before completing");
            if let Err(record_err) = inner
                .diagnostics
                .record(LookupFailure::new(row, &query, &err))
            {
                warn!(?record_err, "failed to record vin lookup failure");
            }
        }
        if rearm {
            warn!("restarting vin lookup queue after drain loop stopped");
            let handler = self.handler.clone();
            let delay = inner.throttle_delay;
            inner.runtime.spawn(async move {
                sleep(delay).await;
                handler.drain().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    use super::*;
    use crate::lookup::VehicleLookup;
    use crate::requests::RequestState;
    use crate::table::{MemoryTable, IDENTIFIER_COLUMN};

    #[derive(Debug, Clone)]
    struct RecordedCall {
        identifier: String,
        year: Option<String>,
        at: Instant,
    }

    #[derive(Default)]
    struct ScriptedLookup {
        calls: parking_lot::Mutex<Vec<RecordedCall>>,
        held: parking_lot::Mutex<HashSet<String>>,
        failing: parking_lot::Mutex<HashSet<String>>,
        panicking: parking_lot::Mutex<HashSet<String>>,
        ignoring_cancel: parking_lot::Mutex<HashSet<String>>,
        responses: parking_lot::Mutex<HashMap<String, VehicleDetails>>,
        cancelled: parking_lot::Mutex<Vec<String>>,
        release: Notify,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ScriptedLookup {
        fn hold(&self, identifier: &str) {
            self.held.lock().insert(identifier.to_string());
        }

        fn unhold(&self, identifier: &str) {
            self.held.lock().remove(identifier);
            self.release.notify_waiters();
        }

        fn fail(&self, identifier: &str) {
            self.failing.lock().insert(identifier.to_string());
        }

        fn panic_on(&self, identifier: &str) {
            self.panicking.lock().insert(identifier.to_string());
        }

        /// Keeps holding until released even after the token fires, then succeeds.
        fn ignore_cancel(&self, identifier: &str) {
            self.ignoring_cancel.lock().insert(identifier.to_string());
        }

        fn respond_with(&self, identifier: &str, details: VehicleDetails) {
            self.responses
                .lock()
                .insert(identifier.to_string(), details);
        }

        fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().clone()
        }

        fn identifiers(&self) -> Vec<String> {
            self.calls().into_iter().map(|call| call.identifier).collect()
        }

        fn cancelled(&self) -> Vec<String> {
            self.cancelled.lock().clone()
        }

        fn max_active(&self) -> usize {
            self.max_active.load(Ordering::SeqCst)
        }

        async fn respond(
            &self,
            query: &LookupQuery,
            cancel: &CancellationToken,
        ) -> AppResult<VehicleDetails> {
            loop {
                let released = self.release.notified();
                let held = self.held.lock().contains(&query.identifier);
                if !held {
                    break;
                }
                let deaf = self.ignoring_cancel.lock().contains(&query.identifier);
                if deaf {
                    released.await;
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.cancelled.lock().push(query.identifier.clone());
                        return Err(AppError::Cancelled);
                    }
                    _ = released => {}
                }
            }

            let panics = self.panicking.lock().contains(&query.identifier);
            if panics {
                panic!("scripted panic for {}", query.identifier);
            }
            let failing = self.failing.lock().contains(&query.identifier);
            if failing {
                return Err(AppError::lookup_failed(Some(500), "scripted failure"));
            }
            let scripted = self.responses.lock().get(&query.identifier).cloned();
            Ok(scripted.unwrap_or_else(|| details_for(&query.identifier)))
        }
    }

    #[async_trait]
    impl VehicleLookup for ScriptedLookup {
        async fn lookup(
            &self,
            query: &LookupQuery,
            cancel: &CancellationToken,
        ) -> AppResult<VehicleDetails> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.calls.lock().push(RecordedCall {
                identifier: query.identifier.clone(),
                year: query.year.clone(),
                at: Instant::now(),
            });
            let outcome = self.respond(query, cancel).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn details_for(identifier: &str) -> VehicleDetails {
        VehicleDetails {
            manufacturer: Some(format!("{identifier} manufacturer")),
            make: Some(format!("{identifier} make")),
            model: Some(format!("{identifier} model")),
            vehicle_type: Some(format!("{identifier} type")),
            body_class: Some(format!("{identifier} class")),
            gvwr: Some(format!("{identifier} gvwr")),
        }
    }

    struct Harness {
        handler: FetchHandler,
        lookup: Arc<ScriptedLookup>,
        table: Arc<MemoryTable>,
        diagnostics: LookupDiagnostics,
    }

    fn harness(throttle_delay_ms: u64) -> Harness {
        let config = AppConfig {
            lookup_endpoint: "http://localhost/decode".into(),
            throttle_delay_ms,
            lookup_timeout_ms: 1_000,
            missing_value_placeholder: "N/A".into(),
            diagnostics_path: None,
            diagnostics_capacity: 10,
        };
        let lookup = Arc::new(ScriptedLookup::default());
        let diagnostics = LookupDiagnostics::in_memory(10);
        let handler = FetchHandler::new(
            &config,
            LookupService::from_lookup(lookup.clone()),
            diagnostics.clone(),
        )
        .unwrap();
        let table = Arc::new(MemoryTable::new());
        let handle: Arc<dyn TableHandle> = table.clone();
        handler.set_instance(Some(handle));
        Harness {
            handler,
            lookup,
            table,
            diagnostics,
        }
    }

    async fn wait_for_calls(lookup: &ScriptedLookup, count: usize) {
        for _ in 0..10_000 {
            if lookup.calls().len() >= count {
                return;
            }
            sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {count} lookups, saw {}", lookup.calls().len());
    }

    fn derived(table: &MemoryTable, row: usize) -> Vec<Option<String>> {
        DERIVED_COLUMNS.map(|col| table.cell(row, col)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn drains_rows_in_arrival_order_with_throttle() {
        let h = harness(100);
        let started = Instant::now();
        for row in 0..3 {
            let vin = format!("VIN{row}");
            h.table.set_cell(row, IDENTIFIER_COLUMN, Some(vin.clone()));
            h.handler.add_request(row, vin, None).unwrap();
        }
        assert_eq!(h.handler.phase(), DrainPhase::Draining);

        h.handler.wait_idle().await;

        assert_eq!(h.lookup.identifiers(), vec!["VIN0", "VIN1", "VIN2"]);
        let calls = h.lookup.calls();
        for pair in calls.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(100));
        }
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(h.lookup.max_active(), 1);
        assert_eq!(h.handler.phase(), DrainPhase::Idle);
        assert_eq!(h.handler.pending_count(), 0);
        assert_eq!(h.table.cell(2, 3).as_deref(), Some("VIN2 make"));
        assert_eq!(h.table.cell(0, 7).as_deref(), Some("VIN0 gvwr"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_add_leaves_entry_untouched() {
        let h = harness(100);
        h.handler
            .add_request(5, "VINX", Some("2020".into()))
            .unwrap();

        let err = h
            .handler
            .add_request(5, "VINY", Some("2021".into()))
            .unwrap_err();

        assert!(matches!(err, AppError::DuplicateRequest(5)));
        let pending = h.handler.pending(5).unwrap();
        assert_eq!(pending.identifier, "VINX");
        assert_eq!(pending.year.as_deref(), Some("2020"));
        assert_eq!(pending.state, RequestState::Queued);
        assert_eq!(h.handler.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn update_without_pending_request_fails() {
        let h = harness(100);
        let err = h
            .handler
            .update_request(3, KeyField::Year, EditAction::Changed, Some("2010".into()))
            .unwrap_err();
        assert!(matches!(err, AppError::NoSuchRequest(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_identifier_cancels_in_flight_lookup() {
        let h = harness(100);
        h.lookup.hold("VIN1");
        h.handler.add_request(0, "VIN1", None).unwrap();
        h.handler.add_request(1, "VIN2", None).unwrap();
        wait_for_calls(&h.lookup, 1).await;
        assert_eq!(
            h.handler.pending(0).unwrap().state,
            RequestState::InProgress
        );
        for col in DERIVED_COLUMNS {
            h.table.set_cell(0, col, Some("stale".into()));
        }

        h.handler
            .update_request(0, KeyField::Identifier, EditAction::Deleted, None)
            .unwrap();

        assert!(!h.handler.has_request(0));
        assert!(derived(&h.table, 0).iter().all(Option::is_none));

        h.handler.wait_idle().await;
        assert_eq!(h.lookup.cancelled(), vec!["VIN1"]);
        assert_eq!(h.lookup.identifiers(), vec!["VIN1", "VIN2"]);
        assert!(derived(&h.table, 0).iter().all(Option::is_none));
        assert_eq!(h.table.cell(1, 2).as_deref(), Some("VIN2 manufacturer"));
        assert_eq!(h.diagnostics.total_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn year_edit_during_lookup_requeues_with_merged_fields() {
        let h = harness(100);
        h.lookup.hold("VIN0");
        h.handler
            .add_request(0, "VIN0", Some("2019".into()))
            .unwrap();
        wait_for_calls(&h.lookup, 1).await;
        let stale = h.handler.pending(0).unwrap().generation;

        h.handler
            .update_request(0, KeyField::Year, EditAction::Changed, Some("2021".into()))
            .unwrap();
        assert!(h.handler.has_request(0));
        h.lookup.unhold("VIN0");
        sleep(Duration::from_millis(1)).await;

        let requeued = h.handler.pending(0).unwrap();
        assert_eq!(requeued.state, RequestState::Queued);
        assert_eq!(requeued.identifier, "VIN0");
        assert_eq!(requeued.year.as_deref(), Some("2021"));
        assert!(requeued.generation > stale);

        h.handler.wait_idle().await;
        let calls = h.lookup.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].identifier, "VIN0");
        assert_eq!(calls[1].year.as_deref(), Some("2021"));
        assert_eq!(h.lookup.cancelled(), vec!["VIN0"]);
        assert_eq!(h.table.cell(0, 4).as_deref(), Some("VIN0 model"));
        assert_eq!(h.lookup.max_active(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_row_goes_behind_waiting_rows() {
        let h = harness(100);
        h.lookup.hold("VIN0");
        h.handler.add_request(0, "VIN0", None).unwrap();
        h.handler.add_request(1, "VIN1", None).unwrap();
        wait_for_calls(&h.lookup, 1).await;

        h.handler
            .update_request(0, KeyField::Year, EditAction::Changed, Some("2000".into()))
            .unwrap();
        h.lookup.unhold("VIN0");
        h.handler.wait_idle().await;

        assert_eq!(h.lookup.identifiers(), vec!["VIN0", "VIN1", "VIN0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_during_lookup_are_all_carried_over() {
        let h = harness(100);
        h.lookup.hold("VIN0");
        h.handler
            .add_request(0, "VIN0", Some("2019".into()))
            .unwrap();
        wait_for_calls(&h.lookup, 1).await;

        h.handler
            .update_request(0, KeyField::Year, EditAction::Changed, Some("2021".into()))
            .unwrap();
        h.handler
            .update_request(0, KeyField::Identifier, EditAction::Changed, Some("VIN9".into()))
            .unwrap();
        h.handler.wait_idle().await;

        let calls = h.lookup.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].identifier, "VIN9");
        assert_eq!(calls[1].year.as_deref(), Some("2021"));
        assert_eq!(h.table.cell(0, 3).as_deref(), Some("VIN9 make"));
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_identifier_before_requeue_wins() {
        let h = harness(100);
        h.lookup.hold("VIN0");
        h.handler
            .add_request(0, "VIN0", Some("2019".into()))
            .unwrap();
        wait_for_calls(&h.lookup, 1).await;

        h.handler
            .update_request(0, KeyField::Year, EditAction::Deleted, None)
            .unwrap();
        h.handler
            .update_request(0, KeyField::Identifier, EditAction::Changed, Some(String::new()))
            .unwrap();
        sleep(Duration::from_millis(1)).await;

        assert!(!h.handler.has_request(0));
        h.handler.wait_idle().await;
        assert_eq!(h.lookup.calls().len(), 1);
        assert!(derived(&h.table, 0).iter().all(Option::is_none));
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_after_identifier_cleared_is_discarded() {
        let h = harness(100);
        h.lookup.hold("VIN0");
        h.lookup.ignore_cancel("VIN0");
        h.handler.add_request(0, "VIN0", None).unwrap();
        h.handler.add_request(1, "VIN1", None).unwrap();
        wait_for_calls(&h.lookup, 1).await;

        h.handler
            .update_request(0, KeyField::Identifier, EditAction::Deleted, None)
            .unwrap();
        h.lookup.unhold("VIN0");
        h.handler.wait_idle().await;

        assert!(h.lookup.cancelled().is_empty());
        assert_eq!(h.lookup.identifiers(), vec!["VIN0", "VIN1"]);
        assert!(derived(&h.table, 0).iter().all(Option::is_none));
        assert_eq!(h.table.cell(1, 3).as_deref(), Some("VIN1 make"));
        assert_eq!(h.diagnostics.total_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_after_year_edit_is_left_to_the_requeued_lookup() {
        let h = harness(100);
        h.lookup.hold("VIN0");
        h.lookup.ignore_cancel("VIN0");
        h.handler
            .add_request(0, "VIN0", Some("2019".into()))
            .unwrap();
        wait_for_calls(&h.lookup, 1).await;

        h.handler
            .update_request(0, KeyField::Year, EditAction::Changed, Some("2021".into()))
            .unwrap();
        h.lookup.unhold("VIN0");
        sleep(Duration::from_millis(1)).await;

        assert_eq!(h.lookup.calls().len(), 1);
        assert!(derived(&h.table, 0).iter().all(Option::is_none));
        let requeued = h.handler.pending(0).unwrap();
        assert_eq!(requeued.state, RequestState::Queued);
        assert_eq!(requeued.year.as_deref(), Some("2021"));

        h.handler.wait_idle().await;
        let calls = h.lookup.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].year.as_deref(), Some("2021"));
        assert_eq!(h.table.cell(0, 4).as_deref(), Some("VIN0 model"));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_lookup_does_not_stall_the_queue() {
        let h = harness(100);
        h.lookup.panic_on("BOOM");
        h.handler
            .add_request(0, "BOOM", Some("2014".into()))
            .unwrap();
        h.handler.add_request(1, "VIN1", None).unwrap();

        tokio::time::timeout(Duration::from_secs(5), h.handler.wait_idle())
            .await
            .expect("queue stalled after a panicking lookup");

        let calls = h.lookup.calls();
        assert_eq!(h.lookup.identifiers(), vec!["BOOM", "VIN1"]);
        assert!(calls[1].at - calls[0].at >= Duration::from_millis(100));
        assert!(!h.handler.has_request(0));
        assert!(derived(&h.table, 0).iter().all(Option::is_none));
        assert_eq!(h.table.cell(1, 3).as_deref(), Some("VIN1 make"));
        assert_eq!(h.handler.phase(), DrainPhase::Idle);

        let failures = h.diagnostics.recent();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].row, 0);
        assert_eq!(failures[0].status, None);
        assert_eq!(failures[0].year.as_deref(), Some("2014"));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_edit_updates_in_place() {
        let h = harness(100);
        for row in 0..3 {
            h.handler
                .add_request(row, format!("VIN{row}"), Some("1990".into()))
                .unwrap();
        }
        h.handler
            .update_request(2, KeyField::Year, EditAction::Changed, Some("2005".into()))
            .unwrap();
        h.handler
            .update_request(1, KeyField::Year, EditAction::Deleted, None)
            .unwrap();

        h.handler.wait_idle().await;

        let calls = h.lookup.calls();
        assert_eq!(h.lookup.identifiers(), vec!["VIN0", "VIN1", "VIN2"]);
        assert_eq!(calls[0].year.as_deref(), Some("1990"));
        assert_eq!(calls[1].year, None);
        assert_eq!(calls[2].year.as_deref(), Some("2005"));
        assert!(h.lookup.cancelled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_fields_get_placeholder() {
        let h = harness(10);
        h.lookup.respond_with(
            "VIN7",
            VehicleDetails {
                vehicle_type: None,
                gvwr: Some("   ".into()),
                ..details_for("VIN7")
            },
        );
        h.handler.add_request(0, "VIN7", None).unwrap();
        h.handler.wait_idle().await;

        assert_eq!(h.table.cell(0, 4).as_deref(), Some("VIN7 model"));
        assert_eq!(h.table.cell(0, 5).as_deref(), Some("N/A"));
        assert_eq!(h.table.cell(0, 6).as_deref(), Some("VIN7 class"));
        assert_eq!(h.table.cell(0, 7).as_deref(), Some("N/A"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookup_is_recorded_and_queue_continues() {
        let h = harness(10);
        h.lookup.fail("BAD");
        h.handler.add_request(0, "BAD", Some("2011".into())).unwrap();
        h.handler.add_request(1, "GOOD", None).unwrap();

        h.handler.wait_idle().await;

        assert!(derived(&h.table, 0).iter().all(Option::is_none));
        assert_eq!(h.table.cell(1, 3).as_deref(), Some("GOOD make"));
        assert!(!h.handler.has_request(0));
        let failures = h.diagnostics.recent();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].row, 0);
        assert_eq!(failures[0].status, Some(500));
        assert_eq!(failures[0].year.as_deref(), Some("2011"));
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_after_going_idle() {
        let h = harness(10);
        h.handler.add_request(0, "VIN0", None).unwrap();
        h.handler.wait_idle().await;
        assert_eq!(h.handler.phase(), DrainPhase::Idle);

        h.handler.add_request(1, "VIN1", None).unwrap();
        assert_eq!(h.handler.phase(), DrainPhase::Draining);
        h.handler.wait_idle().await;

        assert_eq!(h.lookup.identifiers(), vec!["VIN0", "VIN1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_table_handle_keeps_previous_one() {
        let h = harness(10);
        h.handler.set_instance(None);
        h.handler.add_request(0, "VIN0", None).unwrap();
        h.handler.wait_idle().await;

        assert_eq!(h.table.cell(0, 2).as_deref(), Some("VIN0 manufacturer"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_in_flight_lookup() {
        let h = harness(100);
        h.lookup.hold("VIN0");
        h.handler.add_request(0, "VIN0", None).unwrap();
        h.handler.add_request(1, "VIN1", None).unwrap();
        wait_for_calls(&h.lookup, 1).await;

        h.handler.shutdown();
        h.handler.wait_idle().await;
        sleep(Duration::from_millis(1)).await;

        assert_eq!(h.lookup.cancelled(), vec!["VIN0"]);
        assert_eq!(h.lookup.calls().len(), 1);
        assert_eq!(h.handler.phase(), DrainPhase::Idle);
        assert!(matches!(
            h.handler.add_request(2, "VIN2", None),
            Err(AppError::Shutdown)
        ));
    }
}
