//! Allocation ledger
//!
//! Caller-owned bookkeeping of outstanding grants. The protocol itself keeps
//! no state; an orchestrator that wants descendant lookup and cleanup keeps
//! one of these per run, behind its own serialization.

use std::collections::BTreeMap;
use tracing::info;

use super::{
    AllocatedResources, AllocationRecord, ReleaseOutcome, ResourceFlowProtocol, ResourceUsage,
};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Default)]
pub struct AllocationLedger {
    records: BTreeMap<String, AllocationRecord>,
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: AllocationRecord) {
        self.records.insert(record.allocation_id.clone(), record);
    }

    pub fn get(&self, allocation_id: &str) -> Option<&AllocationRecord> {
        self.records.get(allocation_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every outstanding grant below `ancestor`, shallowest first.
    pub fn descendants_of(&self, ancestor: &str) -> Vec<&AllocationRecord> {
        let mut found: Vec<&AllocationRecord> = self
            .records
            .values()
            .filter(|r| r.descends_from(ancestor))
            .collect();
        found.sort_by_key(|r| r.allocation_path.len());
        found
    }

    /// Reconcile `usage` against a grant and drop it from the ledger.
    pub fn release(
        &mut self,
        protocol: &ResourceFlowProtocol,
        allocation_id: &str,
        usage: &ResourceUsage,
    ) -> EngineResult<ReleaseOutcome> {
        let record = self
            .records
            .remove(allocation_id)
            .ok_or_else(|| EngineError::allocation_not_found(allocation_id))?;
        Ok(protocol.release(&record, usage))
    }

    /// Drop every grant below `ancestor` without usage, deepest first, as
    /// when the ancestor's routine is torn down. Each one returns in full.
    pub fn release_descendants(
        &mut self,
        protocol: &ResourceFlowProtocol,
        ancestor: &str,
    ) -> Vec<ReleaseOutcome> {
        let mut ids: Vec<(usize, String)> = self
            .descendants_of(ancestor)
            .into_iter()
            .map(|r| (r.allocation_path.len(), r.allocation_id.clone()))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0));

        let outcomes: Vec<ReleaseOutcome> = ids
            .into_iter()
            .filter_map(|(_, id)| self.records.remove(&id))
            .map(|record| protocol.release(&record, &ResourceUsage::default()))
            .collect();
        if !outcomes.is_empty() {
            info!(ancestor, released = outcomes.len(), "Released descendant allocations");
        }
        outcomes
    }

    /// Sum of everything still granted.
    pub fn outstanding(&self) -> AllocatedResources {
        self.records
            .values()
            .fold(AllocatedResources::default(), |acc, r| {
                acc.saturating_add(&r.allocated)
            })
    }
}
