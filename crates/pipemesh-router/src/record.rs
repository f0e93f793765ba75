//! The persisted per-pipe ownership record.

use serde::{Deserialize, Serialize};

use pipemesh_core::End;

use crate::error::PipeError;

/// Ownership record stored in the KV store for every pipe.
///
/// A live record has `deleted_at == 0`. An empty address means nobody holds
/// that end; a non-empty address always comes with a ref count of at least 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeRecord {
    #[serde(rename = "CreatedAt")]
    pub created_at: i64,
    #[serde(rename = "DeletedAt", default)]
    pub deleted_at: i64,
    #[serde(rename = "UIAddr", default)]
    pub ui_addr: String,
    #[serde(rename = "ProbeAddr", default)]
    pub probe_addr: String,
    #[serde(rename = "UIRefCount", default)]
    pub ui_ref_count: u32,
    #[serde(rename = "ProbeRefCount", default)]
    pub probe_ref_count: u32,
}

impl PipeRecord {
    pub fn new(created_at: i64) -> Self {
        Self {
            created_at,
            ..Self::default()
        }
    }

    pub const fn is_live(&self) -> bool {
        self.deleted_at == 0
    }

    /// Address of the replica holding `end`, empty if unheld.
    pub fn addr(&self, end: End) -> &str {
        match end {
            End::Ui => &self.ui_addr,
            End::Probe => &self.probe_addr,
        }
    }

    pub const fn ref_count(&self, end: End) -> u32 {
        match end {
            End::Ui => self.ui_ref_count,
            End::Probe => self.probe_ref_count,
        }
    }

    /// Whether `addr` holds either end.
    pub fn holds_either(&self, addr: &str) -> bool {
        self.ui_addr == addr || self.probe_addr == addr
    }

    /// Take one more reference on `end` for `addr`. Fails if the record is a
    /// tombstone or another replica holds the end. Returns the new ref count.
    pub fn acquire(&mut self, key: &str, end: End, addr: &str) -> Result<u32, PipeError> {
        if !self.is_live() {
            return Err(PipeError::Tombstoned(key.to_string()));
        }
        let holder = self.addr(end);
        if !holder.is_empty() && holder != addr {
            return Err(PipeError::OwnershipConflict {
                key: key.to_string(),
                end,
                holder: holder.to_string(),
            });
        }
        let (slot, count) = self.end_mut(end);
        addr.clone_into(slot);
        *count += 1;
        Ok(*count)
    }

    /// Drop one reference on `end` held by `addr`, clearing the address when
    /// the count reaches 0. Returns the new ref count.
    pub fn release(&mut self, key: &str, end: End, addr: &str) -> Result<u32, PipeError> {
        let holder = self.addr(end);
        if holder != addr {
            return Err(PipeError::OwnershipViolation {
                key: key.to_string(),
                end,
                holder: holder.to_string(),
            });
        }
        let (slot, count) = self.end_mut(end);
        *count = count.saturating_sub(1);
        if *count == 0 {
            slot.clear();
        }
        Ok(*count)
    }

    /// Mark the record deleted at `now`. A tombstone keeps its first
    /// deletion time.
    pub const fn tombstone(&mut self, now: i64) {
        if self.deleted_at == 0 {
            self.deleted_at = now;
        }
    }

    const fn end_mut(&mut self, end: End) -> (&mut String, &mut u32) {
        match end {
            End::Ui => (&mut self.ui_addr, &mut self.ui_ref_count),
            End::Probe => (&mut self.probe_addr, &mut self.probe_ref_count),
        }
    }
}
