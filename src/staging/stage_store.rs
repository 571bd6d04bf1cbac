//! Stage Store
//!
//! Durable per-kind state machine `Incoming -> Aggregating -> Uploading -> gone`
//! backed by one directory per stage. Every transition is a single `rename`
//! within the kind directory, so a crash leaves a record fully in its origin
//! or its destination stage.
//!
//! ## Record index
//!
//! The store keeps an in-memory index `RecordId -> {stage, owner}` for every
//! record. The directories stay authoritative: `open` rebuilds the index by
//! scanning every stage of every kind, so the index never has to be persisted.
//! Aggregate artifacts and manifests are not indexed; they are listed from
//! the directory directly.
//!
//! ## Locking
//!
//! One mutex per kind serializes structural operations (admission rename,
//! promotion, artifact and manifest creation, deletion). Reading a file that
//! is already isolated in a stage needs no lock.

use super::clock::{Clock, SystemClock};
use super::error::{PipelineError, PipelineResult};
use super::kind::{RecordKind, Stage};
use super::manifest::ArtifactManifest;
use super::naming::{self, EntryClass, MonotonicIdSource, SpecimenName, UniqueIdSource};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const ADMIT_TEMP_PREFIX: &str = ".admit-";

/// Identity of a staged entry: unique within its kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub kind: RecordKind,
    pub name: String,
}

/// A staged entry at a known stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    id: RecordId,
    stage: Stage,
    path: PathBuf,
}

impl RecordHandle {
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn kind(&self) -> RecordKind {
        self.id.kind
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    stage: Stage,
    /// Owner known for this process lifetime (specimens only)
    owner: Option<String>,
}

/// Outcome of a batch promotion
#[derive(Debug, Default)]
pub struct PromoteReport {
    pub moved: Vec<RecordHandle>,
    pub failed: Vec<(RecordHandle, PipelineError)>,
}

impl PromoteReport {
    pub fn all_moved(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Construction-time collaborators of a [`StageStore`]
#[derive(Clone)]
pub struct StageStoreOptions {
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn UniqueIdSource>,
    /// fsync admitted payloads before they become visible
    pub fsync: bool,
}

impl Default for StageStoreOptions {
    fn default() -> Self {
        StageStoreOptions {
            clock: Arc::new(SystemClock),
            ids: Arc::new(MonotonicIdSource::new()),
            fsync: false,
        }
    }
}

impl std::fmt::Debug for StageStoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageStoreOptions")
            .field("fsync", &self.fsync)
            .finish_non_exhaustive()
    }
}

pub struct StageStore {
    base: PathBuf,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn UniqueIdSource>,
    fsync: bool,
    kind_locks: [Mutex<()>; 3],
    index: RwLock<BTreeMap<RecordId, IndexEntry>>,
}

impl std::fmt::Debug for StageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageStore")
            .field("base", &self.base)
            .field("records", &self.index.read().len())
            .finish_non_exhaustive()
    }
}

impl StageStore {
    /// Create the directory layout, drop half-written temp files and rebuild
    /// the record index from disk
    pub fn open(base: impl Into<PathBuf>, options: StageStoreOptions) -> PipelineResult<Self> {
        let store = StageStore {
            base: base.into(),
            clock: options.clock,
            ids: options.ids,
            fsync: options.fsync,
            kind_locks: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
            index: RwLock::new(BTreeMap::new()),
        };

        for kind in RecordKind::ALL {
            for &stage in kind.stages() {
                fs::create_dir_all(store.dir(kind, stage))?;
            }
        }

        store.rebuild_index()?;
        Ok(store)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<dyn UniqueIdSource> {
        &self.ids
    }

    /// Directory backing a stage of a kind
    pub fn stage_dir(&self, kind: RecordKind, stage: Stage) -> PipelineResult<PathBuf> {
        check_stage(kind, stage)?;
        Ok(self.dir(kind, stage))
    }

    fn dir(&self, kind: RecordKind, stage: Stage) -> PathBuf {
        let kind_dir = self.base.join(kind.as_str());
        match stage.dir_name() {
            Some(sub) => kind_dir.join(sub),
            None => kind_dir,
        }
    }

    fn lock(&self, kind: RecordKind) -> MutexGuard<'_, ()> {
        let slot = match kind {
            RecordKind::Usage => 0,
            RecordKind::Error => 1,
            RecordKind::Specimen => 2,
        };
        self.kind_locks[slot].lock()
    }

    fn handle(&self, kind: RecordKind, stage: Stage, name: String) -> RecordHandle {
        let path = self.dir(kind, stage).join(&name);
        RecordHandle {
            id: RecordId { kind, name },
            stage,
            path,
        }
    }

    fn rebuild_index(&self) -> PipelineResult<()> {
        let mut index = BTreeMap::new();
        let mut removed_temps = 0usize;

        for kind in RecordKind::ALL {
            for &stage in kind.stages() {
                for name in read_file_names(&self.dir(kind, stage))? {
                    match naming::classify(&name) {
                        EntryClass::Temp => {
                            remove_if_present(&self.dir(kind, stage).join(&name))?;
                            removed_temps += 1;
                        }
                        EntryClass::Record => {
                            let id = RecordId { kind, name };
                            if let Some(prev) = index.insert(id.clone(), IndexEntry { stage, owner: None }) {
                                warn!(
                                    kind = %kind,
                                    file = %id.name,
                                    first = %prev.stage,
                                    second = %stage,
                                    "Record present in two stages"
                                );
                            }
                        }
                        EntryClass::Artifact | EntryClass::Manifest => {}
                    }
                }
            }
        }

        debug!(
            base = %self.base.display(),
            records = index.len(),
            removed_temps,
            "Stage index rebuilt"
        );
        *self.index.write() = index;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    /// Stage a payload in `kind/Incoming`
    ///
    /// `subject` is the owner for usage/error records and the source URI for
    /// specimens.
    pub fn admit(
        &self,
        kind: RecordKind,
        subject: &str,
        payload: &[u8],
    ) -> PipelineResult<RecordHandle> {
        let name = match kind {
            RecordKind::Specimen => self.specimen_record_name(subject)?,
            _ => {
                naming::validate_owner(subject)?;
                naming::batched_name(self.clock.now_nanos(), self.ids.next_id(), subject)
            }
        };
        self.write_incoming(kind, name, None, payload)
    }

    /// Stage a specimen, remembering its owner for in-process delivery
    pub fn admit_specimen(
        &self,
        owner: &str,
        uri: &str,
        payload: &[u8],
    ) -> PipelineResult<RecordHandle> {
        naming::validate_owner(owner)?;
        let name = self.specimen_record_name(uri)?;
        self.write_incoming(RecordKind::Specimen, name, Some(owner.to_string()), payload)
    }

    fn specimen_record_name(&self, uri: &str) -> PipelineResult<String> {
        if uri.is_empty() {
            return Err(PipelineError::Format("specimen uri must not be empty".to_string()));
        }
        Ok(naming::specimen_name(self.clock.now(), self.ids.next_id(), uri))
    }

    fn write_incoming(
        &self,
        kind: RecordKind,
        name: String,
        owner: Option<String>,
        payload: &[u8],
    ) -> PipelineResult<RecordHandle> {
        let dir = self.dir(kind, Stage::Incoming);
        let temp = dir.join(format!("{}{}", ADMIT_TEMP_PREFIX, name));

        let written = (|| -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(payload)?;
            if self.fsync {
                file.sync_all()?;
            }
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        let handle = self.handle(kind, Stage::Incoming, name);
        let _guard = self.lock(kind);

        if handle.path.exists() {
            let _ = fs::remove_file(&temp);
            return Err(PipelineError::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("record {} already staged", handle.name()),
            )));
        }
        if let Err(e) = fs::rename(&temp, &handle.path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        self.index.write().insert(
            handle.id.clone(),
            IndexEntry {
                stage: Stage::Incoming,
                owner,
            },
        );
        debug!(kind = %kind, file = %handle.name(), bytes = payload.len(), "Record admitted");
        Ok(handle)
    }

    // ------------------------------------------------------------------------
    // Listing
    // ------------------------------------------------------------------------

    /// Records currently in a stage, in ascending name order
    pub fn list(&self, kind: RecordKind, stage: Stage) -> PipelineResult<Vec<RecordHandle>> {
        check_stage(kind, stage)?;
        let index = self.index.read();
        Ok(index
            .iter()
            .filter(|(id, entry)| id.kind == kind && entry.stage == stage)
            .map(|(id, _)| self.handle(kind, stage, id.name.clone()))
            .collect())
    }

    /// Aggregate artifacts in a stage, in ascending name order
    pub fn list_artifacts(&self, kind: RecordKind, stage: Stage) -> PipelineResult<Vec<RecordHandle>> {
        self.list_class(kind, stage, EntryClass::Artifact)
    }

    /// Artifact manifests in a stage, in ascending name order
    pub fn list_manifests(&self, kind: RecordKind, stage: Stage) -> PipelineResult<Vec<RecordHandle>> {
        self.list_class(kind, stage, EntryClass::Manifest)
    }

    fn list_class(
        &self,
        kind: RecordKind,
        stage: Stage,
        class: EntryClass,
    ) -> PipelineResult<Vec<RecordHandle>> {
        check_stage(kind, stage)?;
        let mut names: Vec<String> = read_file_names(&self.dir(kind, stage))?
            .into_iter()
            .filter(|name| naming::classify(name) == class)
            .collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| self.handle(kind, stage, name))
            .collect())
    }

    /// Current location of a record, if it is still staged
    pub fn lookup(&self, kind: RecordKind, name: &str) -> Option<RecordHandle> {
        let id = RecordId {
            kind,
            name: name.to_string(),
        };
        let stage = self.index.read().get(&id)?.stage;
        Some(self.handle(kind, stage, id.name))
    }

    /// Handle for an unindexed entry (artifact or manifest) in a stage
    pub fn entry(&self, kind: RecordKind, stage: Stage, name: &str) -> PipelineResult<RecordHandle> {
        check_stage(kind, stage)?;
        Ok(self.handle(kind, stage, name.to_string()))
    }

    /// Number of indexed records of a kind in a stage
    pub fn count(&self, kind: RecordKind, stage: Stage) -> usize {
        self.index
            .read()
            .iter()
            .filter(|(id, entry)| id.kind == kind && entry.stage == stage)
            .count()
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Move each handle into `to`; one failed move never aborts the others
    pub fn promote(
        &self,
        kind: RecordKind,
        handles: &[RecordHandle],
        to: Stage,
    ) -> PipelineResult<PromoteReport> {
        check_stage(kind, to)?;
        let mut report = PromoteReport::default();
        let _guard = self.lock(kind);

        for handle in handles {
            debug_assert_eq!(handle.kind(), kind, "promoted handle of another kind");
            match self.move_locked(handle, to) {
                Ok(moved) => report.moved.push(moved),
                Err(e) => {
                    warn!(kind = %kind, file = %handle.name(), to = %to, error = %e, "Promote failed");
                    report.failed.push((handle.clone(), e));
                }
            }
        }
        Ok(report)
    }

    /// Move a single handle into `to`
    pub fn promote_single(&self, handle: &RecordHandle, to: Stage) -> PipelineResult<RecordHandle> {
        check_stage(handle.kind(), to)?;
        let _guard = self.lock(handle.kind());
        self.move_locked(handle, to)
    }

    fn move_locked(&self, handle: &RecordHandle, to: Stage) -> PipelineResult<RecordHandle> {
        if handle.stage == to {
            return Ok(handle.clone());
        }
        let target = self.handle(handle.kind(), to, handle.name().to_string());

        if let Err(e) = fs::rename(&handle.path, &target.path) {
            if e.kind() == ErrorKind::NotFound && !target.path.exists() {
                self.index.write().remove(&handle.id);
            }
            return Err(e.into());
        }

        let mut index = self.index.write();
        if let Some(entry) = index.get_mut(&handle.id) {
            entry.stage = to;
        }
        Ok(target)
    }

    /// Delete a staged entry; an already-missing file is not an error
    pub fn finalize(&self, handle: &RecordHandle) -> PipelineResult<()> {
        let _guard = self.lock(handle.kind());
        remove_if_present(&handle.path)?;

        let mut index = self.index.write();
        if index.get(&handle.id).is_some_and(|e| e.stage == handle.stage) {
            index.remove(&handle.id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    pub fn read(&self, handle: &RecordHandle) -> PipelineResult<Vec<u8>> {
        Ok(fs::read(&handle.path)?)
    }

    /// Open for streaming reads of large payloads
    pub fn open_reader(&self, handle: &RecordHandle) -> PipelineResult<File> {
        Ok(File::open(&handle.path)?)
    }

    pub fn decode_specimen_name(&self, handle: &RecordHandle) -> PipelineResult<SpecimenName> {
        if handle.kind() != RecordKind::Specimen {
            return Err(PipelineError::Format(format!(
                "{} is a {} record, not a specimen",
                handle.name(),
                handle.kind()
            )));
        }
        naming::decode_specimen_name(handle.name())
    }

    /// Owner recorded at admission (specimens), or decoded from the name
    /// (usage/error)
    pub fn owner_of(&self, handle: &RecordHandle) -> Option<String> {
        if handle.kind().is_batched() {
            return naming::decode_batched_name(handle.name()).ok().map(|n| n.owner);
        }
        self.index.read().get(&handle.id)?.owner.clone()
    }

    // ------------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------------

    /// Create an empty aggregate artifact in `kind/Aggregating`
    pub fn create_artifact(&self, kind: RecordKind) -> PipelineResult<(RecordHandle, File)> {
        check_stage(kind, Stage::Aggregating)?;
        let name = naming::artifact_name(self.clock.now_nanos(), self.ids.next_id());
        let handle = self.handle(kind, Stage::Aggregating, name);

        let _guard = self.lock(kind);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&handle.path)?;
        Ok((handle, file))
    }

    /// Atomically write a manifest next to its artifact in `kind/Uploading`
    pub fn write_manifest(&self, manifest: &ArtifactManifest) -> PipelineResult<RecordHandle> {
        let kind = manifest.kind;
        check_stage(kind, Stage::Uploading)?;
        let name = naming::manifest_name_for(&manifest.artifact);
        let handle = self.handle(kind, Stage::Uploading, name);
        let temp = self
            .dir(kind, Stage::Uploading)
            .join(format!(".{}.tmp", handle.name()));

        let bytes = manifest.to_json()?;
        let _guard = self.lock(kind);
        let written = (|| -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&temp, &handle.path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(handle)
    }

    pub fn read_manifest(&self, handle: &RecordHandle) -> PipelineResult<ArtifactManifest> {
        let bytes = self.read(handle)?;
        Ok(ArtifactManifest::from_json(&bytes)?)
    }
}

fn check_stage(kind: RecordKind, stage: Stage) -> PipelineResult<()> {
    if kind.supports(stage) {
        Ok(())
    } else {
        Err(PipelineError::InvalidStage { kind, stage })
    }
}

/// Names of the regular files directly inside `dir`
fn read_file_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => warn!(dir = %dir.display(), file = ?raw, "Skipping non-UTF-8 filename"),
        }
    }
    Ok(names)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
