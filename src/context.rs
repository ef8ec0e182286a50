use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::exploration::ExplorationEntry;
use crate::git::GitOperations;
use crate::session::{ChangedFile, FileStatus, ReviewSession};

/// Files larger than this are left out of the snapshot.
const MAX_SNAPSHOT_FILE_BYTES: usize = 256 * 1024;

/// Frozen view of the change under review, taken from the target ref before
/// any fix is applied. Shared read-only by every analysis unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSnapshot {
    pub target: String,
    pub base: String,
    pub diff: String,
    pub changed_files: Vec<ChangedFile>,
    /// Content at `target`, keyed by path.
    pub files: BTreeMap<String, String>,
}

impl ChangeSnapshot {
    pub fn capture(git: &dyn GitOperations, session: &ReviewSession) -> Result<Self> {
        let diff = git.diff(&session.base, &session.target)?;
        let mut files = BTreeMap::new();
        for changed in &session.changed_files {
            if changed.status == FileStatus::Deleted {
                continue;
            }
            match git.show_file(&session.target, &changed.path)? {
                Some(content) if content.len() <= MAX_SNAPSHOT_FILE_BYTES => {
                    files.insert(changed.path.clone(), content);
                }
                Some(content) => {
                    warn!(path = %changed.path, bytes = content.len(), "file too large for snapshot, skipping");
                }
                None => debug!(path = %changed.path, "changed file missing at target"),
            }
        }
        Ok(Self {
            target: session.target.clone(),
            base: session.base.clone(),
            diff,
            changed_files: session.changed_files.clone(),
            files,
        })
    }

    pub fn file(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }
}

/// Immutable input to one analysis call.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub snapshot: Arc<ChangeSnapshot>,
    /// Exploration queue as it stood when the call was prepared.
    pub exploration: Vec<ExplorationEntry>,
    pub focus: Option<Focus>,
    pub max_depth: u32,
}

#[derive(Debug, Clone)]
pub struct Focus {
    pub entry: ExplorationEntry,
    /// Content of the focus target at the target ref, when it is a file.
    pub content: Option<String>,
}

impl AnalysisContext {
    pub fn new(snapshot: Arc<ChangeSnapshot>, exploration: Vec<ExplorationEntry>, max_depth: u32) -> Self {
        Self {
            snapshot,
            exploration,
            focus: None,
            max_depth,
        }
    }

    pub fn with_focus(mut self, focus: Focus) -> Self {
        self.focus = Some(focus);
        self
    }
}
