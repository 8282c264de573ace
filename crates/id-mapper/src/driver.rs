//! Incremental merge pass.
//!
//! A pass walks a fixed sequence of phases:
//!
//! 1. Loading: read the committed mapping (pinned edges) and the checkpoint
//! 2. Ingesting: pull new payloads per service through the normalizer
//! 3. Resolving: drain pending edges through the conflict resolver
//! 4. Serializing: render groups and build the successor checkpoint
//! 5. Persisting: commit mapping and checkpoint together
//!
//! Any phase may end the pass in `Failed`. Nothing touches disk before the
//! persisting phase, so a failed or interrupted pass leaves the last committed
//! state as it was.

use crate::checkpoint::{Checkpoint, CheckpointDraft, CheckpointLoad};
use crate::graph::{IdentityGraph, MergeOutcome, Trust};
use crate::mapping::{MappingRecord, MappingSerializer};
use crate::normalizer::{Normalizer, SkipReason};
use crate::resolver::{ConflictRecord, ConflictResolver};
use crate::source::RecordSource;
use crate::store::{self, StoreError};
use chrono::Utc;
use shared::{DataPaths, MediaKind, Service};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How much of each feed a pass reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunMode {
    /// Read every feed from the start
    Full,
    /// Resume every feed from its checkpoint cursor
    Update,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::Update => write!(f, "update"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PassOptions {
    pub mode: RunMode,
    /// Restrict ingestion to these services; None reads all of the kind
    pub services: Option<Vec<Service>>,
    pub emit_unanchored: bool,
    pub write_conflict_report: bool,
}

impl PassOptions {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            services: None,
            emit_unanchored: true,
            write_conflict_report: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    Loading,
    Ingesting,
    Resolving,
    Serializing,
    Persisting,
}

impl std::fmt::Display for PassPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PassPhase::Loading => "loading",
            PassPhase::Ingesting => "ingesting",
            PassPhase::Resolving => "resolving",
            PassPhase::Serializing => "serializing",
            PassPhase::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

/// Causes that end a pass without committing anything
#[derive(Debug, Error)]
pub enum PassError {
    #[error("Failed to load committed mapping: {0}")]
    Load(#[source] StoreError),

    #[error("Committed mapping {path} is corrupt: {source}")]
    MappingCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to render pass output: {0}")]
    Render(#[source] serde_json::Error),

    #[error("Failed to persist pass output: {0}")]
    Persistence(#[source] StoreError),

    #[error("Pass interrupted while {phase}")]
    Interrupted { phase: PassPhase },
}

/// Outcome of a completed pass
#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub kind: MediaKind,
    pub mode: RunMode,
    /// Rebuilt from the committed mapping without ingesting
    pub degraded: bool,
    pub records_ingested: usize,
    pub records_skipped: BTreeMap<SkipReason, usize>,
    /// Base-service records skipped because their group was already committed
    pub already_resolved: usize,
    pub merges_approved: usize,
    pub merges_redundant: usize,
    /// Hinted edges skipped because an earlier pass rejected them
    pub edges_suppressed: usize,
    pub conflicts: usize,
    pub groups_emitted: usize,
    pub unanchored_groups: usize,
    pub sources_failed: usize,
}

impl PassSummary {
    fn new(kind: MediaKind, mode: RunMode) -> Self {
        Self {
            kind,
            mode,
            degraded: false,
            records_ingested: 0,
            records_skipped: BTreeMap::new(),
            already_resolved: 0,
            merges_approved: 0,
            merges_redundant: 0,
            edges_suppressed: 0,
            conflicts: 0,
            groups_emitted: 0,
            unanchored_groups: 0,
            sources_failed: 0,
        }
    }

    pub fn skipped(&self, reason: SkipReason) -> usize {
        self.records_skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn log(&self) {
        info!(
            kind = %self.kind,
            mode = %self.mode,
            degraded = self.degraded,
            records_ingested = self.records_ingested,
            skipped_malformed = self.skipped(SkipReason::MalformedPayload),
            skipped_unsupported = self.skipped(SkipReason::UnsupportedMediaType),
            already_resolved = self.already_resolved,
            merges_approved = self.merges_approved,
            merges_redundant = self.merges_redundant,
            edges_suppressed = self.edges_suppressed,
            conflicts = self.conflicts,
            groups_emitted = self.groups_emitted,
            unanchored_groups = self.unanchored_groups,
            sources_failed = self.sources_failed,
            "Merge pass complete"
        );
    }
}

/// Working state carried between phases
struct PassContext {
    graph: IdentityGraph,
    /// Checkpoint whose resolved ids and rejections apply to this pass
    prior: Option<Checkpoint>,
    draft: CheckpointDraft,
    conflicts: Vec<ConflictRecord>,
    summary: PassSummary,
}

/// Rendered files waiting to be committed
struct PassOutput {
    mapping: String,
    checkpoint: String,
}

enum PassState {
    Loading,
    Ingesting(PassContext),
    Resolving(PassContext),
    Serializing(PassContext),
    Persisting(PassContext, PassOutput),
    Done(PassSummary),
    Failed(PassError),
}

impl PassState {
    fn phase(&self) -> Option<PassPhase> {
        match self {
            PassState::Loading => Some(PassPhase::Loading),
            PassState::Ingesting(_) => Some(PassPhase::Ingesting),
            PassState::Resolving(_) => Some(PassPhase::Resolving),
            PassState::Serializing(_) => Some(PassPhase::Serializing),
            PassState::Persisting(..) => Some(PassPhase::Persisting),
            PassState::Done(_) | PassState::Failed(_) => None,
        }
    }
}

/// Runs merge passes for one media kind
pub struct MergeDriver<S> {
    kind: MediaKind,
    paths: DataPaths,
    source: S,
    options: PassOptions,
    normalizer: Normalizer,
    resolver: ConflictResolver,
    serializer: MappingSerializer,
    cancel: Arc<AtomicBool>,
}

impl<S: RecordSource> MergeDriver<S> {
    pub fn new(kind: MediaKind, paths: DataPaths, source: S, options: PassOptions) -> Self {
        Self {
            kind,
            paths,
            source,
            normalizer: Normalizer::new(kind),
            resolver: ConflictResolver::new(),
            serializer: MappingSerializer::new(kind, options.emit_unanchored),
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a flag that stops the pass when set
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one pass to completion
    pub fn run(&mut self) -> Result<PassSummary, PassError> {
        info!(kind = %self.kind, mode = %self.options.mode, "Starting merge pass");

        let mut state = PassState::Loading;
        loop {
            if let Some(phase) = state.phase() {
                debug!(%phase, "Entering phase");
            }

            state = match state {
                PassState::Loading => self.load(),
                PassState::Ingesting(ctx) => self.ingest(ctx),
                PassState::Resolving(ctx) => self.resolve(ctx),
                PassState::Serializing(ctx) => self.serialize(ctx),
                PassState::Persisting(ctx, output) => self.persist(ctx, output),
                PassState::Done(summary) => {
                    summary.log();
                    return Ok(summary);
                }
                PassState::Failed(e) => {
                    error!(kind = %self.kind, error = %e, "Merge pass failed");
                    return Err(e);
                }
            };
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Services this pass reads, base service first
    fn selected_services(&self) -> Vec<Service> {
        self.kind
            .services()
            .iter()
            .copied()
            .filter(|service| {
                self.options
                    .services
                    .as_ref()
                    .map_or(true, |wanted| wanted.contains(service))
            })
            .collect()
    }

    fn load(&mut self) -> PassState {
        let mode = self.options.mode;
        let mapping_path = self.paths.mapping_file(self.kind);

        let content = match store::read_optional(&mapping_path) {
            Ok(content) => content,
            Err(e) => return PassState::Failed(PassError::Load(e)),
        };
        let committed: Option<Vec<MappingRecord>> =
            match content.as_deref().map(|c| self.serializer.parse(c)).transpose() {
                Ok(records) => records,
                Err(source) => {
                    return PassState::Failed(PassError::MappingCorrupt {
                        path: mapping_path,
                        source,
                    })
                }
            };

        let checkpoint = match Checkpoint::load(&self.paths.checkpoint_file(self.kind), self.kind) {
            CheckpointLoad::Loaded(checkpoint) => Some(checkpoint),
            CheckpointLoad::Missing => None,
            CheckpointLoad::Corrupt(e) => {
                warn!(error = %e, "Ignoring unusable checkpoint");
                None
            }
        };
        // A checkpoint only describes the mapping it was committed with
        let checkpoint = match (checkpoint, &committed) {
            (Some(_), None) => {
                warn!(
                    kind = %self.kind,
                    path = %mapping_path.display(),
                    "Committed mapping is missing, discarding checkpoint and reading every feed"
                );
                None
            }
            (checkpoint, _) => checkpoint,
        };

        let degraded = mode == RunMode::Update && checkpoint.is_none() && committed.is_some();
        if degraded {
            warn!(
                kind = %self.kind,
                "No usable checkpoint, rebuilding from the committed mapping only"
            );
        }

        let mut draft = match &checkpoint {
            Some(checkpoint) => checkpoint.successor(),
            None => CheckpointDraft::new(self.kind),
        };
        let prior = match mode {
            RunMode::Update => checkpoint,
            RunMode::Full => {
                for service in self.selected_services() {
                    draft.forget(service);
                }
                None
            }
        };
        if let Some(prior) = &prior {
            for edge in &prior.rejected_edges {
                draft.reject(edge.clone());
            }
        }

        let mut graph = IdentityGraph::new(self.kind);
        let records = committed.unwrap_or_default();
        for record in &records {
            graph.pin(&record.ids(), record.parsed_type(self.kind), record.season);
        }
        info!(
            groups = records.len(),
            pinned_edges = graph.pending_edges(),
            "Loaded committed mapping"
        );

        let mut summary = PassSummary::new(self.kind, mode);
        summary.degraded = degraded;
        let ctx = PassContext {
            graph,
            prior,
            draft,
            conflicts: Vec::new(),
            summary,
        };

        if degraded {
            PassState::Resolving(ctx)
        } else {
            PassState::Ingesting(ctx)
        }
    }

    fn ingest(&mut self, mut ctx: PassContext) -> PassState {
        let base = self.kind.base_service();

        for service in self.selected_services() {
            let mut cursor = ctx.draft.cursor(service).cloned();
            let mut ingested = 0usize;

            loop {
                if self.cancelled() {
                    return PassState::Failed(PassError::Interrupted {
                        phase: PassPhase::Ingesting,
                    });
                }

                let batch = match self.source.next_batch(service, cursor.as_ref()) {
                    Ok(Some(batch)) => batch,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%service, error = %e, "Source failed, skipping service");
                        ctx.summary.sources_failed += 1;
                        break;
                    }
                };

                for payload in &batch.payloads {
                    let record = match self.normalizer.normalize(payload) {
                        Ok(record) => record,
                        Err(e) => {
                            debug!(error = %e, "Skipping payload");
                            *ctx.summary.records_skipped.entry(e.reason()).or_default() += 1;
                            continue;
                        }
                    };

                    let resolved = service == base
                        && ctx
                            .prior
                            .as_ref()
                            .is_some_and(|prior| prior.is_resolved(&record.native_id));
                    if resolved {
                        ctx.summary.already_resolved += 1;
                        continue;
                    }

                    ctx.graph.ingest(record);
                    ctx.summary.records_ingested += 1;
                    ingested += 1;
                }

                ctx.draft.advance(service, batch.cursor.clone());
                cursor = Some(batch.cursor);
            }

            if ingested > 0 {
                info!(%service, records = ingested, "Ingested service");
            }
        }

        PassState::Resolving(ctx)
    }

    fn resolve(&mut self, mut ctx: PassContext) -> PassState {
        while let Some(edge) = ctx.graph.next_edge() {
            if self.cancelled() {
                return PassState::Failed(PassError::Interrupted {
                    phase: PassPhase::Resolving,
                });
            }

            // Only hinted edges are remembered as rejected
            let key = (edge.trust == Trust::Hinted).then(|| ctx.graph.edge_key(&edge));
            if let (Some(key), Some(prior)) = (&key, &ctx.prior) {
                if prior.is_rejected(key) {
                    debug!(from = %key.from, to = %key.to, "Suppressed previously rejected edge");
                    ctx.summary.edges_suppressed += 1;
                    continue;
                }
            }

            match ctx.graph.propose_merge(&edge, &self.resolver) {
                MergeOutcome::Merged => ctx.summary.merges_approved += 1,
                MergeOutcome::AlreadyJoined => ctx.summary.merges_redundant += 1,
                MergeOutcome::Rejected(conflicts) => {
                    ctx.summary.conflicts += conflicts.len();
                    if let Some(key) = key {
                        ctx.draft.reject(key);
                    }
                    ctx.conflicts.extend(conflicts);
                }
            }
        }

        info!(
            approved = ctx.summary.merges_approved,
            redundant = ctx.summary.merges_redundant,
            suppressed = ctx.summary.edges_suppressed,
            conflicts = ctx.summary.conflicts,
            "Resolved edges"
        );
        PassState::Serializing(ctx)
    }

    fn serialize(&mut self, mut ctx: PassContext) -> PassState {
        let mut records: Vec<MappingRecord> = ctx
            .graph
            .groups()
            .filter_map(|group| self.serializer.serialize_group(&group))
            .collect();
        self.serializer.sort(&mut records);

        for record in &records {
            match record.base_id(self.kind) {
                Some(base_id) => ctx.draft.mark_resolved(base_id),
                None => ctx.summary.unanchored_groups += 1,
            }
        }
        ctx.summary.groups_emitted = records.len();

        let mapping = match self.serializer.render(&records) {
            Ok(mapping) => mapping,
            Err(e) => return PassState::Failed(PassError::Render(e)),
        };
        let checkpoint = match ctx.draft.clone().finish(Utc::now()).to_json() {
            Ok(checkpoint) => checkpoint,
            Err(e) => return PassState::Failed(PassError::Render(e)),
        };

        PassState::Persisting(ctx, PassOutput { mapping, checkpoint })
    }

    fn persist(&mut self, ctx: PassContext, output: PassOutput) -> PassState {
        if self.cancelled() {
            return PassState::Failed(PassError::Interrupted {
                phase: PassPhase::Persisting,
            });
        }

        let mapping_path = self.paths.mapping_file(self.kind);
        let checkpoint_path = self.paths.checkpoint_file(self.kind);
        for path in [&mapping_path, &checkpoint_path] {
            if let Some(dir) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    return PassState::Failed(PassError::Persistence(StoreError::Write(
                        dir.to_path_buf(),
                        e,
                    )));
                }
            }
        }

        let files = [
            (mapping_path.clone(), output.mapping),
            (checkpoint_path, output.checkpoint),
        ];
        if let Err(e) = store::commit(&files) {
            return PassState::Failed(PassError::Persistence(e));
        }
        info!(
            path = %mapping_path.display(),
            groups = ctx.summary.groups_emitted,
            "Committed mapping and checkpoint"
        );

        if self.options.write_conflict_report {
            self.write_conflict_report(&ctx.conflicts);
        }

        PassState::Done(ctx.summary)
    }

    /// Best effort; the pass has already been committed
    fn write_conflict_report(&self, conflicts: &[ConflictRecord]) {
        let path = self.paths.conflict_report(self.kind);
        let result = serde_json::to_string_pretty(conflicts)
            .map(|mut content| {
                content.push('\n');
                content
            })
            .map_err(|e| e.to_string())
            .and_then(|content| store::write_atomic(&path, &content).map_err(|e| e.to_string()));

        match result {
            Ok(()) => info!(path = %path.display(), conflicts = conflicts.len(), "Wrote conflict report"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write conflict report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Cursor, ScrapedFileSource, SourceBatch, SourceError};
    use anyhow::Result;
    use serde_json::{json, Value};
    use std::path::Path;
    use tempfile::TempDir;

    fn write_scraped(root: &Path, kind: MediaKind, service: Service, items: Value) {
        let path = DataPaths::new(root).scraped_file(kind, service);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, items.to_string()).unwrap();
    }

    fn driver(root: &Path, kind: MediaKind, mode: RunMode) -> MergeDriver<ScrapedFileSource> {
        let paths = DataPaths::new(root);
        let source = ScrapedFileSource::new(paths.clone(), kind, 2);
        MergeDriver::new(kind, paths, source, PassOptions::new(mode))
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn mapping_path(root: &Path, kind: MediaKind) -> PathBuf {
        DataPaths::new(root).mapping_file(kind)
    }

    fn checkpoint_path(root: &Path, kind: MediaKind) -> PathBuf {
        DataPaths::new(root).checkpoint_file(kind)
    }

    /// anidb:1 with two AniList records both claiming it
    fn write_contested(root: &Path) {
        write_scraped(root, MediaKind::Anime, Service::Anidb, json!([{ "id": 1, "title": "Trigun" }]));
        write_scraped(
            root,
            MediaKind::Anime,
            Service::Anilist,
            json!([
                { "id": 290, "title": "Trigun", "external_ids": { "anidb": 1 } },
                { "id": 291, "title": "Trigun Stampede", "external_ids": { "anidb": 1 } }
            ]),
        );
    }

    #[test]
    fn test_hint_joins_base_record() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_scraped(root, MediaKind::Anime, Service::Anidb, json!([{ "id": 1, "type": "TV Series" }]));
        write_scraped(
            root,
            MediaKind::Anime,
            Service::Anilist,
            json!([{ "id": 290, "external_ids": { "anidb": "1" } }]),
        );

        let summary = driver(root, MediaKind::Anime, RunMode::Update).run()?;
        assert_eq!(summary.records_ingested, 2);
        assert_eq!(summary.merges_approved, 1);
        assert_eq!(summary.groups_emitted, 1);
        assert!(!summary.degraded);

        assert_eq!(
            read_json(&mapping_path(root, MediaKind::Anime)),
            json!([{ "type": "TV", "anidb_id": 1, "anilist_id": 290 }])
        );
        let checkpoint = read_json(&checkpoint_path(root, MediaKind::Anime));
        assert_eq!(checkpoint["resolved_base_ids"], json!(["1"]));
        assert_eq!(checkpoint["cursors"]["anilist"], "1");
        Ok(())
    }

    #[test]
    fn test_competing_hints_are_reported() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_contested(root);

        let summary = driver(root, MediaKind::Anime, RunMode::Update).run()?;
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.unanchored_groups, 1);

        let mapping = read_json(&mapping_path(root, MediaKind::Anime));
        assert_eq!(mapping, json!([{ "anidb_id": 1, "anilist_id": 290 }, { "anilist_id": 291 }]));

        let report = read_json(&DataPaths::new(root).conflict_report(MediaKind::Anime));
        assert_eq!(report[0]["service"], "anilist");
        assert_eq!(report[0]["candidates"][0]["native_id"], "290");
        assert_eq!(report[0]["candidates"][1]["native_id"], "291");
        assert_eq!(report[0]["edge"]["trust"], "hinted");

        let checkpoint = read_json(&checkpoint_path(root, MediaKind::Anime));
        assert_eq!(
            checkpoint["rejected_edges"],
            json!([{ "from": "anidb:1", "to": "anilist:291" }])
        );
        Ok(())
    }

    #[test]
    fn test_pinned_mapping_beats_fresh_hint() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        let mapping = mapping_path(root, MediaKind::Anime);
        std::fs::create_dir_all(mapping.parent().unwrap())?;
        std::fs::write(&mapping, json!([{ "anidb_id": 1, "anilist_id": 290 }]).to_string())?;
        write_scraped(
            root,
            MediaKind::Anime,
            Service::Anilist,
            json!([{ "id": 999, "external_ids": { "anidb": 1 } }]),
        );

        let summary = driver(root, MediaKind::Anime, RunMode::Full).run()?;
        assert_eq!(summary.conflicts, 1);
        assert_eq!(
            read_json(&mapping),
            json!([{ "anidb_id": 1, "anilist_id": 290 }, { "anilist_id": 999 }])
        );

        let report = read_json(&DataPaths::new(root).conflict_report(MediaKind::Anime));
        assert_eq!(report[0]["candidates"][1]["native_id"], "999");
        Ok(())
    }

    #[test]
    fn test_repeated_pass_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_contested(root);
        write_scraped(
            root,
            MediaKind::Anime,
            Service::Kitsu,
            json!([{ "id": 3, "type": "TV", "external_ids": { "anilist": 290, "myanimelist": 4 } }]),
        );

        driver(root, MediaKind::Anime, RunMode::Update).run()?;
        let first = std::fs::read_to_string(mapping_path(root, MediaKind::Anime))?;

        let summary = driver(root, MediaKind::Anime, RunMode::Update).run()?;
        let second = std::fs::read_to_string(mapping_path(root, MediaKind::Anime))?;
        assert_eq!(summary.records_ingested, 0);
        assert_eq!(first, second);

        driver(root, MediaKind::Anime, RunMode::Full).run()?;
        let third = std::fs::read_to_string(mapping_path(root, MediaKind::Anime))?;
        assert_eq!(first, third);
        Ok(())
    }

    #[test]
    fn test_deleted_checkpoint_rebuilds_from_mapping() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_scraped(root, MediaKind::Anime, Service::Anidb, json!([{ "id": 1 }]));
        write_scraped(
            root,
            MediaKind::Anime,
            Service::Anilist,
            json!([{ "id": 290, "external_ids": { "anidb": 1 } }]),
        );
        write_scraped(
            root,
            MediaKind::Anime,
            Service::Mal,
            json!([{ "id": 5, "external_ids": { "anidb": 1 } }]),
        );

        driver(root, MediaKind::Anime, RunMode::Update).run()?;
        let committed = std::fs::read_to_string(mapping_path(root, MediaKind::Anime))?;
        std::fs::remove_file(checkpoint_path(root, MediaKind::Anime))?;

        let degraded = driver(root, MediaKind::Anime, RunMode::Update).run()?;
        assert!(degraded.degraded);
        assert_eq!(degraded.records_ingested, 0);
        assert_eq!(std::fs::read_to_string(mapping_path(root, MediaKind::Anime))?, committed);
        let checkpoint = read_json(&checkpoint_path(root, MediaKind::Anime));
        assert_eq!(checkpoint["cursors"], json!({}));

        // the next run reads the feeds again
        let resumed = driver(root, MediaKind::Anime, RunMode::Update).run()?;
        assert!(!resumed.degraded);
        assert_eq!(resumed.already_resolved, 1);
        assert_eq!(resumed.records_ingested, 2);
        assert_eq!(resumed.conflicts, 0);
        assert_eq!(std::fs::read_to_string(mapping_path(root, MediaKind::Anime))?, committed);
        Ok(())
    }

    #[test]
    fn test_rejected_edge_is_suppressed_later() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_contested(root);
        driver(root, MediaKind::Anime, RunMode::Update).run()?;

        // the scraper emits the same contested record again
        write_scraped(
            root,
            MediaKind::Anime,
            Service::Anilist,
            json!([
                { "id": 290, "external_ids": { "anidb": 1 } },
                { "id": 291, "external_ids": { "anidb": 1 } },
                { "id": 291, "external_ids": { "anidb": 1 } }
            ]),
        );
        let summary = driver(root, MediaKind::Anime, RunMode::Update).run()?;
        assert_eq!(summary.records_ingested, 1);
        assert_eq!(summary.edges_suppressed, 1);
        assert_eq!(summary.conflicts, 0);

        let checkpoint = read_json(&checkpoint_path(root, MediaKind::Anime));
        assert_eq!(checkpoint["rejected_edges"].as_array().map(Vec::len), Some(1));
        Ok(())
    }

    #[test]
    fn test_full_pass_forgets_rejections() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_contested(root);
        driver(root, MediaKind::Anime, RunMode::Update).run()?;

        write_scraped(
            root,
            MediaKind::Anime,
            Service::Anilist,
            json!([{ "id": 290, "external_ids": { "anidb": 1 } }]),
        );
        let summary = driver(root, MediaKind::Anime, RunMode::Full).run()?;
        assert_eq!(summary.conflicts, 0);

        let checkpoint = read_json(&checkpoint_path(root, MediaKind::Anime));
        assert_eq!(checkpoint["rejected_edges"], json!([]));
        Ok(())
    }

    #[test]
    fn test_deleted_mapping_reads_feeds_again() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_scraped(root, MediaKind::Anime, Service::Anidb, json!([{ "id": 1 }]));
        write_scraped(
            root,
            MediaKind::Anime,
            Service::Anilist,
            json!([{ "id": 290, "external_ids": { "anidb": 1 } }]),
        );

        driver(root, MediaKind::Anime, RunMode::Update).run()?;
        let committed = std::fs::read_to_string(mapping_path(root, MediaKind::Anime))?;
        std::fs::remove_file(mapping_path(root, MediaKind::Anime))?;
        assert!(checkpoint_path(root, MediaKind::Anime).exists());

        let rebuilt = driver(root, MediaKind::Anime, RunMode::Update).run()?;
        assert!(!rebuilt.degraded);
        assert_eq!(rebuilt.records_ingested, 2);
        assert_eq!(rebuilt.already_resolved, 0);
        assert_eq!(std::fs::read_to_string(mapping_path(root, MediaKind::Anime))?, committed);

        let next = driver(root, MediaKind::Anime, RunMode::Update).run()?;
        assert_eq!(next.records_ingested, 0);
        assert_eq!(std::fs::read_to_string(mapping_path(root, MediaKind::Anime))?, committed);
        Ok(())
    }

    #[test]
    fn test_failed_commit_keeps_prior_state() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_scraped(root, MediaKind::Anime, Service::Anidb, json!([{ "id": 1 }]));
        driver(root, MediaKind::Anime, RunMode::Update).run()?;

        let mapping = mapping_path(root, MediaKind::Anime);
        let checkpoint = checkpoint_path(root, MediaKind::Anime);
        let mapping_before = std::fs::read(&mapping)?;
        let checkpoint_before = std::fs::read(&checkpoint)?;

        // the checkpoint cannot be set aside, so the commit stops after the
        // mapping was already moved to its backup
        let blocked = checkpoint.with_file_name("mapper-checkpoint.json.bak");
        std::fs::create_dir_all(blocked.join("occupied"))?;

        write_scraped(
            root,
            MediaKind::Anime,
            Service::Anilist,
            json!([{ "id": 290, "external_ids": { "anidb": 1 } }]),
        );
        let result = driver(root, MediaKind::Anime, RunMode::Update).run();

        assert!(matches!(result, Err(PassError::Persistence(StoreError::Rename(..)))));
        assert_eq!(std::fs::read(&mapping)?, mapping_before);
        assert_eq!(std::fs::read(&checkpoint)?, checkpoint_before);
        assert!(!mapping.with_file_name("anime-list-full-mapped.json.bak").exists());
        assert!(!mapping.with_file_name("anime-list-full-mapped.json.tmp").exists());
        assert!(!checkpoint.with_file_name("mapper-checkpoint.json.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_bad_payloads_are_counted() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_scraped(
            root,
            MediaKind::Manga,
            Service::Anilist,
            json!([
                { "id": "x" },
                { "id": 5, "type": "PODCAST" },
                { "id": 6, "type": "TV" },
                { "id": 7, "type": "Manga" }
            ]),
        );

        let summary = driver(root, MediaKind::Manga, RunMode::Update).run()?;
        assert_eq!(summary.records_ingested, 1);
        assert_eq!(summary.skipped(SkipReason::MalformedPayload), 1);
        assert_eq!(summary.skipped(SkipReason::UnsupportedMediaType), 2);
        assert_eq!(
            read_json(&mapping_path(root, MediaKind::Manga)),
            json!([{ "type": "MANGA", "anilist_id": 7 }])
        );
        Ok(())
    }

    #[test]
    fn test_corrupt_mapping_fails_without_writing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        let mapping = mapping_path(root, MediaKind::Anime);
        std::fs::create_dir_all(mapping.parent().unwrap())?;
        std::fs::write(&mapping, "[{ broken")?;
        write_scraped(root, MediaKind::Anime, Service::Anidb, json!([{ "id": 1 }]));

        let result = driver(root, MediaKind::Anime, RunMode::Full).run();
        assert!(matches!(result, Err(PassError::MappingCorrupt { .. })));
        assert_eq!(std::fs::read_to_string(&mapping)?, "[{ broken");
        assert!(!checkpoint_path(root, MediaKind::Anime).exists());
        Ok(())
    }

    #[test]
    fn test_cancelled_pass_writes_nothing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_scraped(root, MediaKind::Anime, Service::Anidb, json!([{ "id": 1 }]));

        let cancel = Arc::new(AtomicBool::new(true));
        let result = driver(root, MediaKind::Anime, RunMode::Update)
            .with_cancel_flag(cancel)
            .run();

        assert!(matches!(
            result,
            Err(PassError::Interrupted {
                phase: PassPhase::Ingesting
            })
        ));
        assert!(!mapping_path(root, MediaKind::Anime).exists());
        Ok(())
    }

    struct FlakySource;

    impl RecordSource for FlakySource {
        fn next_batch(
            &mut self,
            service: Service,
            since: Option<&Cursor>,
        ) -> Result<Option<SourceBatch>, SourceError> {
            match (service, since) {
                (Service::Mal, _) => Err(SourceError::NotAnArray {
                    path: PathBuf::from("myanimelist-manga.json"),
                }),
                (Service::Anilist, None) => Ok(Some(SourceBatch {
                    payloads: vec![crate::source::RawPayload {
                        service,
                        fields: json!({ "id": 30013, "external_ids": { "mal": 13 } }),
                    }],
                    cursor: Cursor("a".to_string()),
                })),
                _ => Ok(None),
            }
        }
    }

    #[test]
    fn test_failed_source_is_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        let mut options = PassOptions::new(RunMode::Update);
        options.services = Some(vec![Service::Anilist, Service::Mal]);

        let summary = MergeDriver::new(MediaKind::Manga, DataPaths::new(root), FlakySource, options).run()?;
        assert_eq!(summary.sources_failed, 1);
        assert_eq!(summary.records_ingested, 1);

        let checkpoint = read_json(&checkpoint_path(root, MediaKind::Manga));
        assert_eq!(checkpoint["cursors"], json!({ "anilist": "a" }));
        Ok(())
    }
}
