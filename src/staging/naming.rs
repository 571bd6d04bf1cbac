//! Staged Filename Codec
//!
//! Record names carry the only metadata a staged file has, so the grammar is
//! fixed and must stay readable by older deployments:
//!
//! ```text
//! usage/error: <unix-nanos>.<id>.<owner>
//! specimen:    <yyyyMMddHHmmss>.<micros>.<id>.<query-escaped-uri>
//! ```
//!
//! Batched names sort lexicographically in chronological order. Specimen
//! names are decoded by locating the first three dots: the timestamp is
//! everything before the second dot, the URI everything after the third.
//!
//! Besides records, a stage directory may hold aggregate artifacts, their
//! source manifests and hidden admission temp files. [`classify`] tells them
//! apart.

use super::error::{PipelineError, PipelineResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Characters left untouched by query escaping (besides ASCII alphanumerics)
const QUERY_ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const SPECIMEN_TIME_FORMAT: &str = "%Y%m%d%H%M%S%.6f";
const SPECIMEN_TIME_PARSE: &str = "%Y%m%d%H%M%S%.f";

const ARTIFACT_PREFIX: &str = "aggregate_";
const ARTIFACT_SUFFIX: &str = ".gz";
const MANIFEST_SUFFIX: &str = ".sources.json";

// ============================================================================
// Unique id sources
// ============================================================================

/// Source of the decimal id field embedded in every generated name
pub trait UniqueIdSource: Send + Sync + 'static {
    fn next_id(&self) -> u64;
}

/// Uses the OS process id, matching names written by earlier deployments
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessIdSource;

impl UniqueIdSource for ProcessIdSource {
    fn next_id(&self) -> u64 {
        u64::from(std::process::id())
    }
}

/// Random base plus a per-call counter
///
/// Survives PID reuse across container restarts and separates names generated
/// within the same nanosecond.
#[derive(Debug)]
pub struct MonotonicIdSource {
    next: AtomicU64,
}

impl MonotonicIdSource {
    pub fn new() -> Self {
        let base: u64 = rand::thread_rng().gen_range(1..(1u64 << 40));
        Self::starting_at(base)
    }

    /// Deterministic source for simulation
    pub fn starting_at(base: u64) -> Self {
        MonotonicIdSource {
            next: AtomicU64::new(base),
        }
    }
}

impl Default for MonotonicIdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl UniqueIdSource for MonotonicIdSource {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

// ============================================================================
// Query escaping
// ============================================================================

/// Escape a string for use inside a filename or URL query
///
/// Spaces become `+`, everything outside `[A-Za-z0-9-_.~]` becomes `%XX`.
pub fn query_escape(s: &str) -> String {
    // '%' itself is escaped, so "%20" can only come from a space
    utf8_percent_encode(s, QUERY_ESCAPE_SET)
        .to_string()
        .replace("%20", "+")
}

/// Inverse of [`query_escape`]; rejects malformed escapes and invalid UTF-8
pub fn query_unescape(s: &str) -> PipelineResult<String> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(PipelineError::Format(format!("invalid escape in {:?}", s)));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    let spaced = s.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| PipelineError::Format(format!("escaped value is not UTF-8: {}", e)))
}

// ============================================================================
// Record names
// ============================================================================

/// Reject owners that cannot be embedded in a filename
pub fn validate_owner(owner: &str) -> PipelineResult<()> {
    if owner.is_empty() {
        return Err(PipelineError::Format("owner must not be empty".to_string()));
    }
    if owner.contains(['/', '\\', '\0']) {
        return Err(PipelineError::Format(format!(
            "owner {:?} contains a path separator or NUL",
            owner
        )));
    }
    Ok(())
}

pub fn batched_name(unix_nanos: i64, id: u64, owner: &str) -> String {
    debug_assert!(unix_nanos >= 0, "timestamps before the epoch break name ordering");
    format!("{}.{}.{}", unix_nanos, id, owner)
}

/// Decoded usage/error record name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchedName {
    pub unix_nanos: i64,
    pub id: u64,
    pub owner: String,
}

pub fn decode_batched_name(name: &str) -> PipelineResult<BatchedName> {
    let mut parts = name.splitn(3, '.');
    let (Some(nanos), Some(id), Some(owner)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(PipelineError::Format(format!(
            "record name {:?} has fewer than two dots",
            name
        )));
    };

    let unix_nanos = nanos
        .parse::<i64>()
        .map_err(|_| PipelineError::Format(format!("bad timestamp in {:?}", name)))?;
    let id = id
        .parse::<u64>()
        .map_err(|_| PipelineError::Format(format!("bad id in {:?}", name)))?;
    if owner.is_empty() {
        return Err(PipelineError::Format(format!("empty owner in {:?}", name)));
    }

    Ok(BatchedName {
        unix_nanos,
        id,
        owner: owner.to_string(),
    })
}

/// Build a specimen name; the timestamp always carries six fractional digits
pub fn specimen_name(at: DateTime<Utc>, id: u64, uri: &str) -> String {
    format!(
        "{}.{}.{}",
        at.format(SPECIMEN_TIME_FORMAT),
        id,
        query_escape(uri)
    )
}

/// Decoded specimen record name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecimenName {
    pub uri: String,
    pub timestamp: DateTime<Utc>,
}

pub fn decode_specimen_name(name: &str) -> PipelineResult<SpecimenName> {
    let dots: Vec<usize> = name.match_indices('.').map(|(i, _)| i).take(3).collect();
    if dots.len() < 3 {
        return Err(PipelineError::Format(format!(
            "specimen name {:?} has fewer than three dots",
            name
        )));
    }

    let ts_part = &name[..dots[1]];
    let uri_part = &name[dots[2] + 1..];
    if ts_part.is_empty() || uri_part.is_empty() {
        return Err(PipelineError::Format(format!(
            "specimen name {:?} has an empty timestamp or uri",
            name
        )));
    }

    let uri = query_unescape(uri_part)?;
    let timestamp = NaiveDateTime::parse_from_str(ts_part, SPECIMEN_TIME_PARSE)
        .map_err(|e| PipelineError::Format(format!("bad timestamp in {:?}: {}", name, e)))?
        .and_utc();

    Ok(SpecimenName { uri, timestamp })
}

// ============================================================================
// Artifacts and manifests
// ============================================================================

pub fn artifact_name(unix_nanos: i64, id: u64) -> String {
    format!("{}{}.{}{}", ARTIFACT_PREFIX, unix_nanos, id, ARTIFACT_SUFFIX)
}

pub fn is_artifact_name(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX) && name.ends_with(ARTIFACT_SUFFIX)
}

pub fn is_manifest_name(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX) && name.ends_with(MANIFEST_SUFFIX)
}

/// Manifest name belonging to an artifact name
pub fn manifest_name_for(artifact: &str) -> String {
    let stem = artifact.strip_suffix(ARTIFACT_SUFFIX).unwrap_or(artifact);
    format!("{}{}", stem, MANIFEST_SUFFIX)
}

/// Artifact name a manifest describes
pub fn artifact_name_for(manifest: &str) -> String {
    let stem = manifest.strip_suffix(MANIFEST_SUFFIX).unwrap_or(manifest);
    format!("{}{}", stem, ARTIFACT_SUFFIX)
}

/// What a directory entry inside a stage directory is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    Record,
    Artifact,
    Manifest,
    /// Hidden file (admission or manifest temp)
    Temp,
}

pub fn classify(name: &str) -> EntryClass {
    if name.starts_with('.') {
        EntryClass::Temp
    } else if is_manifest_name(name) {
        EntryClass::Manifest
    } else if is_artifact_name(name) {
        EntryClass::Artifact
    } else {
        EntryClass::Record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_query_escape_matches_form_encoding() {
        assert_eq!(
            query_escape("http://example.com/test file.png"),
            "http%3A%2F%2Fexample.com%2Ftest+file.png"
        );
        assert_eq!(query_escape("a+b&c=d"), "a%2Bb%26c%3Dd");
        assert_eq!(query_escape("-_.~"), "-_.~");
    }

    #[test]
    fn test_query_unescape_round_trip() {
        for uri in [
            "http://example.com/test file.png",
            "https://host:8080/p?q=1&r=two words#frag",
            "100% legit + plus",
            "ünïcode/päth",
        ] {
            assert_eq!(query_unescape(&query_escape(uri)).unwrap(), uri);
        }
    }

    #[test]
    fn test_query_unescape_rejects_bad_escapes() {
        assert!(query_unescape("abc%2").is_err());
        assert!(query_unescape("abc%zz").is_err());
        assert!(query_unescape("%ff%fe").is_err());
    }

    #[test]
    fn test_batched_name_sorts_chronologically() {
        let a = batched_name(1_700_000_000_000_000_001, 7, "alice");
        let b = batched_name(1_700_000_000_000_000_010, 3, "bob");
        assert!(a < b);

        let decoded = decode_batched_name(&a).unwrap();
        assert_eq!(decoded.unix_nanos, 1_700_000_000_000_000_001);
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.owner, "alice");
    }

    #[test]
    fn test_batched_owner_may_contain_dots() {
        let name = batched_name(5, 1, "team.alpha");
        assert_eq!(decode_batched_name(&name).unwrap().owner, "team.alpha");
    }

    #[test]
    fn test_decode_batched_rejects_garbage() {
        assert!(decode_batched_name("notes.txt").is_err());
        assert!(decode_batched_name("123.456.").is_err());
        assert!(decode_batched_name("abc.1.owner").is_err());
    }

    #[test]
    fn test_specimen_name_round_trip() {
        let at = Utc
            .with_ymd_and_hms(2024, 3, 5, 7, 8, 9)
            .unwrap()
            .with_nanosecond(123_456_000)
            .unwrap();
        let uri = "http://example.com/test file.png?x=1";
        let name = specimen_name(at, 4242, uri);

        assert!(name.starts_with("20240305070809.123456.4242."));
        assert!(name.ends_with("test+file.png%3Fx%3D1"));

        let decoded = decode_specimen_name(&name).unwrap();
        assert_eq!(decoded.uri, uri);
        assert_eq!(decoded.timestamp, at);
    }

    #[test]
    fn test_specimen_name_keeps_zero_fraction() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let name = specimen_name(at, 1, "x");
        assert_eq!(name, "20240101000000.000000.1.x");
        assert_eq!(decode_specimen_name(&name).unwrap().timestamp, at);
    }

    #[test]
    fn test_decode_specimen_requires_three_dots() {
        assert!(decode_specimen_name("20240101000000.000000.1").is_err());
        assert!(decode_specimen_name("nodots").is_err());
        assert!(decode_specimen_name("20240101000000.000000.1.").is_err());
        assert!(decode_specimen_name("garbage.000000.1.uri").is_err());
    }

    #[test]
    fn test_validate_owner() {
        assert!(validate_owner("alice").is_ok());
        assert!(validate_owner("").is_err());
        assert!(validate_owner("../etc").is_err());
        assert!(validate_owner("a\0b").is_err());
    }

    #[test]
    fn test_classify_entries() {
        let artifact = artifact_name(10, 2);
        assert_eq!(artifact, "aggregate_10.2.gz");
        assert_eq!(classify(&artifact), EntryClass::Artifact);

        let manifest = manifest_name_for(&artifact);
        assert_eq!(manifest, "aggregate_10.2.sources.json");
        assert_eq!(classify(&manifest), EntryClass::Manifest);
        assert_eq!(artifact_name_for(&manifest), artifact);

        assert_eq!(classify(".admit-1.2.alice"), EntryClass::Temp);
        assert_eq!(classify("1.2.alice"), EntryClass::Record);
    }

    #[test]
    fn test_monotonic_ids_are_distinct() {
        let ids = MonotonicIdSource::starting_at(100);
        assert_eq!(ids.next_id(), 100);
        assert_eq!(ids.next_id(), 101);
        assert_eq!(ProcessIdSource.next_id(), u64::from(std::process::id()));
    }
}
