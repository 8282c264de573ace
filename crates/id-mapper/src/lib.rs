//! Cross-service id mapper for anime and manga.
//!
//! This library resolves which ids on AniDB, AniList, MyAnimeList, Kitsu and
//! the other catalogues denote the same title, and keeps a committed mapping
//! file up to date across incremental runs.

pub mod checkpoint;
pub mod driver;
pub mod graph;
pub mod mapping;
pub mod normalizer;
pub mod registry;
pub mod resolver;
pub mod source;
pub mod store;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointLoad};
pub use driver::{MergeDriver, PassError, PassOptions, PassSummary, RunMode};
pub use graph::{IdentityGraph, IdentityGroup, MergeOutcome, NodeKey, Trust};
pub use mapping::{MappingRecord, MappingSerializer};
pub use normalizer::{NormalizeError, Normalizer, ServiceRecord, SkipReason};
pub use resolver::{ConflictRecord, ConflictResolver};
pub use source::{Cursor, RawPayload, RecordSource, ScrapedFileSource};
