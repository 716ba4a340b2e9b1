use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanType {
    Duplicates,
    SimilarImages,
    SimilarVideos,
    SimilarMusic,
    EmptyDirs,
    EmptyFiles,
    Temporary,
    Symlinks,
    BadExtensions,
    Broken,
}

impl ScanType {
    pub const ALL: [ScanType; 10] = [
        ScanType::Duplicates,
        ScanType::SimilarImages,
        ScanType::SimilarVideos,
        ScanType::SimilarMusic,
        ScanType::EmptyDirs,
        ScanType::EmptyFiles,
        ScanType::Temporary,
        ScanType::Symlinks,
        ScanType::BadExtensions,
        ScanType::Broken,
    ];

    /// `czkawka_cli` v11 subcommand for this scan.
    pub fn subcommand(self) -> &'static str {
        match self {
            ScanType::Duplicates => "dup",
            ScanType::SimilarImages => "image",
            ScanType::SimilarVideos => "video",
            ScanType::SimilarMusic => "music",
            ScanType::EmptyDirs => "empty-folders",
            ScanType::EmptyFiles => "empty-files",
            ScanType::Temporary => "temp",
            ScanType::Symlinks => "symlinks",
            ScanType::BadExtensions => "ext",
            ScanType::Broken => "broken",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanType::Duplicates => "duplicates",
            ScanType::SimilarImages => "similar-images",
            ScanType::SimilarVideos => "similar-videos",
            ScanType::SimilarMusic => "similar-music",
            ScanType::EmptyDirs => "empty-dirs",
            ScanType::EmptyFiles => "empty-files",
            ScanType::Temporary => "temporary",
            ScanType::Symlinks => "symlinks",
            ScanType::BadExtensions => "bad-extensions",
            ScanType::Broken => "broken",
        }
    }

    /// Whether the tool reports clusters of related files rather than single items.
    pub fn is_grouped(self) -> bool {
        matches!(
            self,
            ScanType::Duplicates
                | ScanType::SimilarImages
                | ScanType::SimilarVideos
                | ScanType::SimilarMusic
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value || kind.subcommand() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }
}

pub const SEARCH_METHODS: [&str; 3] = ["HASH", "SIZE", "NAME"];

/// Scan-type specific knobs. Only the fields relevant to the job's
/// [`ScanType`] are passed to the tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_difference: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music_similarity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub scan_type: ScanType,
    pub directories: Vec<String>,
    #[serde(default)]
    pub excluded_directories: Vec<String>,
    #[serde(default)]
    pub options: ScanOptions,
}

impl ScanRequest {
    pub fn new(scan_type: ScanType, directories: Vec<String>) -> Self {
        Self {
            scan_type,
            directories,
            excluded_directories: Vec::new(),
            options: ScanOptions::default(),
        }
    }

    /// Rejects requests that must never reach the job state machine.
    pub fn validate(&self) -> Result<()> {
        if self.directories.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one directory is required".into(),
            ));
        }
        if self.directories.iter().any(|dir| dir.trim().is_empty()) {
            return Err(Error::InvalidArgument(
                "directory entries must not be blank".into(),
            ));
        }
        if let Some(method) = self.options.search_method.as_deref() {
            let upper = method.to_ascii_uppercase();
            if !SEARCH_METHODS.contains(&upper.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "unknown search method: {method}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    #[serde(default)]
    pub current_stage: String,
    #[serde(default)]
    pub current_file: String,
    #[serde(default)]
    pub files_processed: u64,
    #[serde(default)]
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileGroup {
    pub id: u64,
    pub files: Vec<FileEntry>,
    pub total_size: u64,
}

/// Normalized tool output. Grouped scans fill `groups`, flat scans fill `files`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResults {
    #[serde(default)]
    pub groups: Vec<FileGroup>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl ScanResults {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.files.is_empty()
    }

    pub fn findings_count(&self) -> u64 {
        if self.groups.is_empty() {
            self.files.len() as u64
        } else {
            self.groups.len() as u64
        }
    }

    pub fn total_size(&self) -> u64 {
        // Sizes come from tool output and may be absurd; never overflow.
        let grouped = self
            .groups
            .iter()
            .map(|group| group.total_size)
            .fold(0u64, u64::saturating_add);
        let flat = self
            .files
            .iter()
            .map(|file| file.size)
            .fold(0u64, u64::saturating_add);
        grouped.saturating_add(flat)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: String,
    pub scan_type: ScanType,
    pub status: ScanStatus,
    pub directories: Vec<String>,
    #[serde(default)]
    pub excluded_directories: Vec<String>,
    #[serde(default)]
    pub options: ScanOptions,
    #[serde(default)]
    pub progress: ScanProgress,
    #[serde(default)]
    pub results: Option<ScanResults>,
    #[serde(default)]
    pub findings_count: u64,
    #[serde(default)]
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ScanJob {
    pub fn pending(id: String, request: ScanRequest) -> Self {
        Self {
            id,
            scan_type: request.scan_type,
            status: ScanStatus::Pending,
            directories: request.directories,
            excluded_directories: request.excluded_directories,
            options: request.options,
            progress: ScanProgress::default(),
            results: None,
            findings_count: 0,
            total_size: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Stores normalized results together with the aggregates derived from them.
    pub fn set_results(&mut self, results: ScanResults) {
        self.findings_count = results.findings_count();
        self.total_size = results.total_size();
        self.results = Some(results);
    }
}
