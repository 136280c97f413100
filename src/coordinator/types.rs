// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

/// Where a lookup was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
    Storage,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Remote => "remote",
            Tier::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Hit,
    /// Negative entry, or storage confirmed the row is missing.
    Absent,
    Miss,
}

impl LookupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupOutcome::Hit => "hit",
            LookupOutcome::Absent => "absent",
            LookupOutcome::Miss => "miss",
        }
    }
}

pub(crate) fn record_lookup(tier: Tier, entity: &str, outcome: LookupOutcome) {
    crate::metrics::record_lookup(tier.as_str(), entity, outcome.as_str());
}
