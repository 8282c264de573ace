//! File path utilities for organizing data files.
//!
//! This module provides a centralized way to manage file paths for scraper
//! output, committed mapping files, conflict reports and mapper checkpoints.

use crate::config::Config;
use crate::models::{MediaKind, Service};
use std::path::{Path, PathBuf};

/// File path manager for data files
#[derive(Debug, Clone)]
pub struct DataPaths {
    scraped: PathBuf,
    mapped: PathBuf,
    checkpoints: PathBuf,
}

impl DataPaths {
    /// Create a new DataPaths with the default layout under a root directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            scraped: root.join("scraped-data"),
            mapped: root.join("mapped-data"),
            checkpoints: root.join("checkpoints"),
        }
    }

    /// Create DataPaths from the configured directories
    pub fn from_config(config: &Config) -> Self {
        Self {
            scraped: config.scraped_dir(),
            mapped: config.mapped_dir(),
            checkpoints: config.checkpoint_dir(),
        }
    }

    // ========== Scraper output (INPUT) ==========

    /// Get scraper output directory for a media kind
    pub fn scraped_dir(&self, kind: MediaKind) -> PathBuf {
        self.scraped.join(kind.as_str())
    }

    /// Get the scraper output file for one service
    pub fn scraped_file(&self, kind: MediaKind, service: Service) -> PathBuf {
        self.scraped_dir(kind)
            .join(format!("{}-{}.json", service.file_tag(), kind))
    }

    // ========== Mapping output (PERMANENT) ==========

    /// Get the committed mapping file
    pub fn mapping_file(&self, kind: MediaKind) -> PathBuf {
        self.mapped.join(format!("{}-list-full-mapped.json", kind))
    }

    /// Get the conflict report written alongside the mapping
    pub fn conflict_report(&self, kind: MediaKind) -> PathBuf {
        self.mapped.join(format!("{}-conflicts.json", kind))
    }

    // ========== Checkpoints ==========

    /// Get the mapper checkpoint file
    pub fn checkpoint_file(&self, kind: MediaKind) -> PathBuf {
        self.checkpoints
            .join(kind.as_str())
            .join("mapper-checkpoint.json")
    }

    // ========== Utility Methods ==========

    /// Create all output directories for a media kind
    pub fn create_dirs(&self, kind: MediaKind) -> std::io::Result<()> {
        let dirs = vec![self.mapped.clone(), self.checkpoints.join(kind.as_str())];

        for dir in dirs {
            std::fs::create_dir_all(&dir)?;
        }

        Ok(())
    }
}
