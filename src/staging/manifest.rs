//! Artifact Source Manifests
//!
//! When an aggregate artifact is promoted to Uploading, a manifest naming the
//! source records it was built from is written next to it. The manifest is
//! the source of truth for which records an undelivered artifact has already
//! consumed:
//!
//! - sources listed by a pending manifest are excluded from later cycles, so a
//!   failed upload is retried with the same artifact instead of a regenerated one
//! - after the artifact is delivered, the listed sources are finalized
//! - a manifest whose artifact is gone means the artifact was delivered before
//!   a crash, and only the source cleanup is left to do

use super::kind::RecordKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactManifest {
    pub kind: RecordKind,
    /// Artifact filename (inside the Uploading stage)
    pub artifact: String,
    /// Source record names in the order they were written into the artifact
    pub sources: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ArtifactManifest {
    pub fn new(
        kind: RecordKind,
        artifact: String,
        sources: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let manifest = ArtifactManifest {
            kind,
            artifact,
            sources,
            created_at,
        };

        #[cfg(debug_assertions)]
        manifest.verify_invariants();

        manifest
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn contains(&self, source: &str) -> bool {
        self.sources.iter().any(|s| s == source)
    }

    /// TigerStyle: Verify all invariants hold
    ///
    /// # Invariants
    /// - Only batched kinds produce artifacts
    /// - Sources are in ascending (chronological) name order
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        debug_assert!(
            self.kind.is_batched(),
            "Invariant violated: {} does not aggregate",
            self.kind
        );
        debug_assert!(
            self.sources.windows(2).all(|w| w[0] < w[1]),
            "Invariant violated: manifest sources must be sorted and unique"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manifest_serialization() {
        let manifest = ArtifactManifest::new(
            RecordKind::Usage,
            "aggregate_1.2.gz".to_string(),
            vec!["1.1.alice".to_string(), "2.1.bob".to_string()],
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        );

        let json = manifest.to_json().unwrap();
        let text = String::from_utf8(json.clone()).unwrap();
        assert!(text.contains("\"kind\": \"usage\""));

        let decoded = ArtifactManifest::from_json(&json).unwrap();
        assert_eq!(decoded, manifest);
        assert!(decoded.contains("2.1.bob"));
        assert!(!decoded.contains("3.1.carol"));
    }

    #[test]
    fn test_manifest_rejects_garbage() {
        assert!(ArtifactManifest::from_json(b"{not json").is_err());
    }
}
