use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

pub const REASON_PENDING_TRANSFER: &str = "pending transfer";
pub const REASON_UNSUPPORTED_EXT: &str = "unsupported extension";
pub const REASON_BLACKLISTED: &str = "blacklisted";
pub const REASON_BELOW_MIN_SIZE: &str = "below minimum size";
pub const REASON_INVALID_PICKCODE: &str = "invalid pickcode";
pub const REASON_EXISTING_PLACEHOLDER: &str = "existing placeholder";
pub const REASON_RATE_LIMITED: &str = "rate limited";
pub const REASON_FORBIDDEN: &str = "forbidden";
pub const REASON_UNRESOLVED: &str = "unresolved remote path";

/// Per-run counters. Every skip and failure carries a reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub generated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub failed: u64,
    pub pruned: u64,
    pub downloaded: u64,
    pub reasons: BTreeMap<String, u64>,
}

impl SyncSummary {
    pub fn skip(&mut self, reason: &str) {
        self.skipped += 1;
        self.note(reason);
    }

    pub fn fail(&mut self, reason: &str) {
        self.failed += 1;
        self.note(reason);
    }

    pub fn merge(&mut self, other: SyncSummary) {
        self.generated += other.generated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.pruned += other.pruned;
        self.downloaded += other.downloaded;
        for (reason, count) in other.reasons {
            *self.reasons.entry(reason).or_default() += count;
        }
    }

    pub fn reason_count(&self, reason: &str) -> u64 {
        self.reasons.get(reason).copied().unwrap_or(0)
    }

    fn note(&mut self, reason: &str) {
        *self.reasons.entry(reason.to_string()).or_default() += 1;
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generated={} unchanged={} skipped={} failed={} pruned={} downloaded={}",
            self.generated,
            self.unchanged,
            self.skipped,
            self.failed,
            self.pruned,
            self.downloaded
        )?;
        for (reason, count) in &self.reasons {
            write!(f, " [{reason}: {count}]")?;
        }
        Ok(())
    }
}
