//! Record Kinds and Stages
//!
//! Every record belongs to one kind, and every staged file sits in exactly
//! one stage of its kind. Stages map 1:1 onto directories:
//!
//! ```text
//! <base>/<kind>/               Incoming
//! <base>/<kind>/aggregation/   Aggregating (batched kinds only)
//! <base>/<kind>/uploading/     Uploading
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category of ingested record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Usage events, aggregated periodically
    Usage,
    /// Error events, aggregated periodically
    Error,
    /// Binary specimens, delivered one by one on the fast path
    Specimen,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Usage, RecordKind::Error, RecordKind::Specimen];

    /// Kinds that go through the aggregator
    pub const BATCHED: [RecordKind; 2] = [RecordKind::Usage, RecordKind::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Usage => "usage",
            RecordKind::Error => "error",
            RecordKind::Specimen => "specimen",
        }
    }

    pub fn is_batched(&self) -> bool {
        !matches!(self, RecordKind::Specimen)
    }

    /// Stages this kind passes through, in order
    pub fn stages(&self) -> &'static [Stage] {
        if self.is_batched() {
            &[Stage::Incoming, Stage::Aggregating, Stage::Uploading]
        } else {
            &[Stage::Incoming, Stage::Uploading]
        }
    }

    pub fn supports(&self, stage: Stage) -> bool {
        self.stages().contains(&stage)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "usage" => Ok(RecordKind::Usage),
            "error" => Ok(RecordKind::Error),
            "specimen" => Ok(RecordKind::Specimen),
            other => Err(format!("unknown record kind: {}", other)),
        }
    }
}

/// Position of a staged file in the delivery pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Incoming,
    Aggregating,
    Uploading,
}

impl Stage {
    /// Subdirectory below the kind directory (`None` for the kind directory itself)
    pub fn dir_name(&self) -> Option<&'static str> {
        match self {
            Stage::Incoming => None,
            Stage::Aggregating => Some("aggregation"),
            Stage::Uploading => Some("uploading"),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Incoming => "incoming",
            Stage::Aggregating => "aggregating",
            Stage::Uploading => "uploading",
        };
        f.write_str(name)
    }
}
