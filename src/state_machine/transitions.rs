//! # Status Model
//!
//! Data-driven description of a domain's closed status set and its three
//! transition tables:
//!
//! - **claim**: pending → processing, applied atomically with lock acquisition
//! - **success**: processing → next pending or terminal status
//! - **retry**: processing → pending, applied after a transient failure
//!
//! Tables are plain immutable maps validated once in [`StatusModelBuilder::build`],
//! so lookups at runtime never fail for statuses that belong to the model.

use std::collections::{HashMap, HashSet};

use crate::error::{ProcessingError, Result};

use super::status::{ProcessingPhase, Status};

/// Closed set of domain statuses plus their transition tables
#[derive(Debug, Clone)]
pub struct StatusModel {
    statuses: Vec<Status>,
    by_code: HashMap<String, Status>,
    claim: HashMap<Status, Status>,
    success: HashMap<Status, Status>,
    retry: HashMap<Status, Status>,
    predecessor: HashMap<Status, Status>,
    default_failure: Status,
}

impl StatusModel {
    pub fn builder() -> StatusModelBuilder {
        StatusModelBuilder::default()
    }

    /// All statuses in declaration order
    pub fn statuses(&self) -> &[Status] {
        &self.statuses
    }

    /// Look up a status by its stable code
    pub fn status(&self, code: &str) -> Result<&Status> {
        self.by_code
            .get(code)
            .ok_or_else(|| ProcessingError::UnknownStatus(code.to_string()))
    }

    pub fn contains(&self, status: &Status) -> bool {
        self.by_code.contains_key(status.code())
    }

    /// Every status whose phase is PENDING; never empty for a built model
    pub fn pending_statuses(&self) -> HashSet<Status> {
        self.statuses_in_phase(ProcessingPhase::Pending)
    }

    pub fn statuses_in_phase(&self, phase: ProcessingPhase) -> HashSet<Status> {
        self.statuses
            .iter()
            .filter(|s| s.phase() == phase)
            .cloned()
            .collect()
    }

    /// The status new objects start in: the first pending status declared
    pub fn initial_status(&self) -> &Status {
        // build() guarantees at least one pending status
        self.statuses
            .iter()
            .find(|s| s.is_pending())
            .unwrap_or(&self.statuses[0])
    }

    pub fn claim_transition(&self, pending: &Status) -> Option<&Status> {
        self.claim.get(pending)
    }

    pub fn success_transition(&self, processing: &Status) -> Option<&Status> {
        self.success.get(processing)
    }

    pub fn retry_transition(&self, processing: &Status) -> Option<&Status> {
        self.retry.get(processing)
    }

    /// The pending status whose claim produced `processing`
    pub fn pending_predecessor(&self, processing: &Status) -> Option<&Status> {
        self.predecessor.get(processing)
    }

    /// Terminal FAILED status assigned once attempts are exhausted
    pub fn default_failure_status(&self) -> &Status {
        &self.default_failure
    }

    /// Claim table as `(pending, processing)` pairs
    pub fn claim_pairs(&self) -> Vec<(Status, Status)> {
        self.claim
            .iter()
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect()
    }

    /// Reverse claim table as `(processing, pending)` pairs, used by the stale-lock sweep
    pub fn reversion_pairs(&self) -> Vec<(Status, Status)> {
        self.predecessor
            .iter()
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect()
    }
}

/// Builder collecting statuses and transitions by code
#[derive(Debug, Default)]
pub struct StatusModelBuilder {
    statuses: Vec<Status>,
    claim: Vec<(String, String)>,
    success: Vec<(String, String)>,
    retry: Vec<(String, String)>,
    default_failure: Option<String>,
}

impl StatusModelBuilder {
    pub fn status(mut self, status: Status) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = Status>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    pub fn claim_transition(mut self, pending: &str, processing: &str) -> Self {
        self.claim.push((pending.to_string(), processing.to_string()));
        self
    }

    pub fn success_transition(mut self, processing: &str, next: &str) -> Self {
        self.success.push((processing.to_string(), next.to_string()));
        self
    }

    pub fn retry_transition(mut self, processing: &str, pending: &str) -> Self {
        self.retry.push((processing.to_string(), pending.to_string()));
        self
    }

    pub fn default_failure_status(mut self, failed: &str) -> Self {
        self.default_failure = Some(failed.to_string());
        self
    }

    /// Validate totality of the tables and freeze the model
    pub fn build(self) -> Result<StatusModel> {
        let mut by_code = HashMap::with_capacity(self.statuses.len());
        for status in &self.statuses {
            if by_code
                .insert(status.code().to_string(), status.clone())
                .is_some()
            {
                return Err(invalid(format!("duplicate status code '{}'", status.code())));
            }
        }

        let has_phase = |phase| self.statuses.iter().any(|s| s.phase() == phase);
        if !has_phase(ProcessingPhase::Pending) {
            return Err(invalid("at least one pending status is required"));
        }
        if !has_phase(ProcessingPhase::Completed) {
            return Err(invalid("at least one completed status is required"));
        }
        if !has_phase(ProcessingPhase::Failed) {
            return Err(invalid("at least one failed status is required"));
        }

        let claim = resolve_table("claim", &self.claim, &by_code, |from, to| {
            from.is_pending() && to.is_processing()
        })?;
        let success = resolve_table("success", &self.success, &by_code, |from, to| {
            from.is_processing() && !to.is_processing()
        })?;
        let retry = resolve_table("retry", &self.retry, &by_code, |from, to| {
            from.is_processing() && to.is_pending()
        })?;

        let mut predecessor = HashMap::with_capacity(claim.len());
        for (pending, processing) in &claim {
            if let Some(existing) = predecessor.insert(processing.clone(), pending.clone()) {
                return Err(invalid(format!(
                    "claim table is not injective: '{}' and '{}' both claim into '{}'",
                    existing.code(),
                    pending.code(),
                    processing.code()
                )));
            }
        }

        for status in &self.statuses {
            match status.phase() {
                ProcessingPhase::Pending if !claim.contains_key(status) => {
                    return Err(invalid(format!(
                        "pending status '{}' has no claim transition",
                        status.code()
                    )));
                }
                ProcessingPhase::Processing => {
                    if !success.contains_key(status) {
                        return Err(invalid(format!(
                            "processing status '{}' has no success transition",
                            status.code()
                        )));
                    }
                    if !retry.contains_key(status) {
                        return Err(invalid(format!(
                            "processing status '{}' has no retry transition",
                            status.code()
                        )));
                    }
                    if !predecessor.contains_key(status) {
                        return Err(invalid(format!(
                            "processing status '{}' is not reachable by any claim",
                            status.code()
                        )));
                    }
                }
                _ => {}
            }
        }

        let default_failure = match &self.default_failure {
            Some(code) => by_code
                .get(code)
                .cloned()
                .ok_or_else(|| ProcessingError::UnknownStatus(code.clone()))?,
            None => self
                .statuses
                .iter()
                .find(|s| s.phase() == ProcessingPhase::Failed)
                .cloned()
                .ok_or_else(|| invalid("no failed status available"))?,
        };
        if default_failure.phase() != ProcessingPhase::Failed {
            return Err(invalid(format!(
                "default failure status '{}' must be in the failed phase",
                default_failure.code()
            )));
        }

        Ok(StatusModel {
            statuses: self.statuses,
            by_code,
            claim,
            success,
            retry,
            predecessor,
            default_failure,
        })
    }
}

fn invalid(msg: impl Into<String>) -> ProcessingError {
    ProcessingError::InvalidStatusModel(msg.into())
}

fn resolve_table(
    table: &str,
    entries: &[(String, String)],
    by_code: &HashMap<String, Status>,
    allowed: impl Fn(&Status, &Status) -> bool,
) -> Result<HashMap<Status, Status>> {
    let mut resolved = HashMap::with_capacity(entries.len());
    for (from_code, to_code) in entries {
        let from = by_code
            .get(from_code)
            .ok_or_else(|| ProcessingError::UnknownStatus(from_code.clone()))?;
        let to = by_code
            .get(to_code)
            .ok_or_else(|| ProcessingError::UnknownStatus(to_code.clone()))?;
        if !allowed(from, to) {
            return Err(invalid(format!(
                "{table} transition {from:?} -> {to:?} crosses phases it may not cross"
            )));
        }
        if resolved.insert(from.clone(), to.clone()).is_some() {
            return Err(invalid(format!(
                "{table} table maps '{from_code}' more than once"
            )));
        }
    }
    Ok(resolved)
}
