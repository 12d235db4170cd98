use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, AppResult};
use crate::lookup::LookupQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyField {
    Identifier,
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Changed,
    Deleted,
}

#[derive(Debug, Clone)]
pub enum RequestStatus {
    Queued,
    InProgress {
        cancel: CancellationToken,
        restart_scheduled: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    InProgress,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub identifier: String,
    pub year: Option<String>,
    pub status: RequestStatus,
    generation: u64,
}

impl PendingRequest {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> RequestState {
        match self.status {
            RequestStatus::Queued => RequestState::Queued,
            RequestStatus::InProgress { .. } => RequestState::InProgress,
        }
    }

    pub fn set_field(&mut self, field: KeyField, value: Option<String>) {
        let value = value.filter(|v| !v.trim().is_empty());
        match field {
            KeyField::Identifier => self.identifier = value.unwrap_or_default(),
            KeyField::Year => self.year = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub row: usize,
    pub identifier: String,
    pub year: Option<String>,
    pub state: RequestState,
    pub generation: u64,
}

/// A request the drain loop has taken ownership of.
#[derive(Debug, Clone)]
pub struct ClaimedRequest {
    pub row: usize,
    pub generation: u64,
    pub query: LookupQuery,
    pub cancel: CancellationToken,
}

/// Outstanding lookups keyed by row.
///
/// Each entry carries a generation stamp drawn from a monotonic counter. The
/// stamp orders the queue and identifies an entry across suspension points,
/// so a stale completion can never remove a newer entry for the same row.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<usize, PendingRequest>,
    next_generation: u64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, row: usize, identifier: String, year: Option<String>) -> AppResult<u64> {
        if self.entries.contains_key(&row) {
            return Err(AppError::DuplicateRequest(row));
        }
        let generation = self.bump();
        self.entries.insert(
            row,
            PendingRequest {
                identifier,
                year: year.filter(|y| !y.trim().is_empty()),
                status: RequestStatus::Queued,
                generation,
            },
        );
        Ok(generation)
    }

    pub fn contains(&self, row: usize) -> bool {
        self.entries.contains_key(&row)
    }

    pub fn get_mut(&mut self, row: usize) -> Option<&mut PendingRequest> {
        self.entries.get_mut(&row)
    }

    pub fn remove(&mut self, row: usize) -> Option<PendingRequest> {
        self.entries.remove(&row)
    }

    pub fn remove_if_generation(&mut self, row: usize, generation: u64) -> Option<PendingRequest> {
        match self.entries.get(&row) {
            Some(entry) if entry.generation == generation => self.entries.remove(&row),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn in_progress_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry.status, RequestStatus::InProgress { .. }))
            .count()
    }

    pub fn has_queued(&self) -> bool {
        self.entries
            .values()
            .any(|entry| matches!(entry.status, RequestStatus::Queued))
    }

    pub fn snapshot(&self, row: usize) -> Option<PendingSnapshot> {
        self.entries.get(&row).map(|entry| PendingSnapshot {
            row,
            identifier: entry.identifier.clone(),
            year: entry.year.clone(),
            state: entry.state(),
            generation: entry.generation,
        })
    }

    /// Marks the oldest queued entry in progress and hands it to the caller.
    ///
    /// `parent` is the token the new lookup token is derived from.
    pub fn claim_next(&mut self, parent: &CancellationToken) -> Option<ClaimedRequest> {
        debug_assert_eq!(self.in_progress_count(), 0, "claim while a lookup is in flight");
        let (&row, entry) = self
            .entries
            .iter_mut()
            .filter(|(_, entry)| matches!(entry.status, RequestStatus::Queued))
            .min_by_key(|(_, entry)| entry.generation)?;

        let cancel = parent.child_token();
        entry.status = RequestStatus::InProgress {
            cancel: cancel.clone(),
            restart_scheduled: false,
        };
        Some(ClaimedRequest {
            row,
            generation: entry.generation,
            query: LookupQuery::new(entry.identifier.clone(), entry.year.clone()),
            cancel,
        })
    }

    /// Replaces a superseded in-progress entry with a fresh queued one at the back of the queue.
    ///
    /// Only the entry matching `generation` with a restart scheduled is replaced, so
    /// running this twice for the same supersession is a no-op the second time.
    pub fn requeue_superseded(&mut self, row: usize, generation: u64) -> Option<u64> {
        let entry = self.entries.get(&row)?;
        let superseded = entry.generation == generation
            && matches!(
                entry.status,
                RequestStatus::InProgress {
                    restart_scheduled: true,
                    ..
                }
            );
        if !superseded {
            return None;
        }
        let fresh_generation = self.bump();
        let entry = self.entries.get_mut(&row)?;
        entry.status = RequestStatus::Queued;
        entry.generation = fresh_generation;
        Some(fresh_generation)
    }

    fn bump(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}
