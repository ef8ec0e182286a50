use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::exploration::ExplorationQueue;
use crate::locate::Anchor;
use crate::registry::ReviewerId;

/// Session phase. `Init` is the only initial phase; `Done` and `Failed`
/// are the only terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Exploring,
    Analyzing,
    Sequencing,
    DraftCreated,
    Fixing,
    Finalizing,
    Done,
    Failed,
}

impl Phase {
    /// The next phase on the happy path.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Init => Some(Phase::Exploring),
            Phase::Exploring => Some(Phase::Analyzing),
            Phase::Analyzing => Some(Phase::Sequencing),
            Phase::Sequencing => Some(Phase::DraftCreated),
            Phase::DraftCreated => Some(Phase::Fixing),
            Phase::Fixing => Some(Phase::Finalizing),
            Phase::Finalizing => Some(Phase::Done),
            Phase::Done | Phase::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Strictly forward: only the successor, or `Failed` from any non-terminal.
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Phase::Failed || self.successor() == Some(next)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Exploring => "exploring",
            Phase::Analyzing => "analyzing",
            Phase::Sequencing => "sequencing",
            Phase::DraftCreated => "draft_created",
            Phase::Fixing => "fixing",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    #[default]
    Apply,
    Report,
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyMode::Apply => f.write_str("apply"),
            ApplyMode::Report => f.write_str("report"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReviewerState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ReviewerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReviewerState::Succeeded | ReviewerState::Failed)
    }
}

impl fmt::Display for ReviewerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReviewerState::Pending => "pending",
            ReviewerState::Running => "running",
            ReviewerState::Succeeded => "succeeded",
            ReviewerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerStatus {
    pub reviewer: ReviewerId,
    pub state: ReviewerState,
    pub error: Option<String>,
    #[serde(default)]
    pub findings_count: u32,
    /// Agent cost in USD across every analysis pass of this reviewer.
    #[serde(default)]
    pub cost_usd: f64,
}

impl ReviewerStatus {
    pub fn pending(reviewer: ReviewerId) -> Self {
        Self {
            reviewer,
            state: ReviewerState::Pending,
            error: None,
            findings_count: 0,
            cost_usd: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FixState {
    #[default]
    NotStarted,
    Applying,
    Applied,
    Failed,
    Skipped,
}

impl FixState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FixState::Applied | FixState::Failed | FixState::Skipped)
    }
}

impl fmt::Display for FixState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FixState::NotStarted => "not_started",
            FixState::Applying => "applying",
            FixState::Applied => "applied",
            FixState::Failed => "failed",
            FixState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Fix-phase attributes of a finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FixRecord {
    pub state: FixState,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub commit: Option<String>,
    pub error: Option<String>,
    /// Set once the outcome has been acknowledged by the publication layer.
    #[serde(default)]
    pub published: bool,
    /// Agent cost in USD of the fix attempt, when the agent reported one.
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub reviewer: ReviewerId,
    /// Position within the reviewer's own output.
    pub emission: u32,
    pub file: String,
    /// Line at analysis time. Advisory only once any fix has been applied.
    pub line: u32,
    pub line_end: Option<u32>,
    pub title: String,
    pub description: String,
    pub scenario: Option<String>,
    pub fix_plan: Option<String>,
    pub fix_summary: Option<String>,
    #[serde(default)]
    pub report_only: bool,
    pub anchor: Option<Anchor>,
    pub sequence: Option<u32>,
    #[serde(default)]
    pub fix: FixRecord,
}

impl Finding {
    pub fn finding_id(reviewer: &ReviewerId, emission: u32) -> String {
        format!("{reviewer}-{emission:03}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileStatus,
    #[serde(default)]
    pub additions: u32,
    #[serde(default)]
    pub deletions: u32,
}

/// Reference to the tracking change-request opened for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRef {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub phase: Phase,
    pub message: String,
    pub at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSession {
    pub id: String,
    pub target: String,
    pub base: String,
    pub phase: Phase,
    pub created_at: u64,
    pub updated_at: u64,
    pub mode: ApplyMode,
    #[serde(default)]
    pub publish: bool,
    #[serde(default)]
    pub debug: bool,
    pub fix_branch: Option<String>,
    pub tracking: Option<TrackingRef>,
    /// Sequence number of the last finding whose fix outcome is recorded.
    #[serde(default)]
    pub fix_cursor: u32,
    #[serde(default)]
    pub changed_files: Vec<ChangedFile>,
    /// In registration order.
    #[serde(default)]
    pub reviewers: Vec<ReviewerStatus>,
    #[serde(default)]
    pub exploration: ExplorationQueue,
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub fault: Option<Fault>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ReviewSession {
    pub fn new(id: &str, target: &str, base: &str, mode: ApplyMode) -> Self {
        let now = now_secs();
        Self {
            id: id.to_string(),
            target: target.to_string(),
            base: base.to_string(),
            phase: Phase::Init,
            created_at: now,
            updated_at: now,
            mode,
            publish: false,
            debug: false,
            fix_branch: None,
            tracking: None,
            fix_cursor: 0,
            changed_files: Vec::new(),
            reviewers: Vec::new(),
            exploration: ExplorationQueue::default(),
            findings: Vec::new(),
            fault: None,
            warnings: Vec::new(),
        }
    }

    /// Session id derived from the target and the creation time.
    pub fn make_id(target: &str, created_at: u64) -> String {
        let slug = slugify(target);
        let slug = if slug.is_empty() { "session".to_string() } else { slug };
        format!("{slug}-{created_at}")
    }

    pub fn reviewer(&self, id: &ReviewerId) -> Option<&ReviewerStatus> {
        self.reviewers.iter().find(|r| &r.reviewer == id)
    }

    pub fn reviewer_mut(&mut self, id: &ReviewerId) -> Option<&mut ReviewerStatus> {
        self.reviewers.iter_mut().find(|r| &r.reviewer == id)
    }

    /// Registration position of a reviewer, used as the primary merge key.
    pub fn reviewer_position(&self, id: &ReviewerId) -> Option<usize> {
        self.reviewers.iter().position(|r| &r.reviewer == id)
    }

    pub fn finding(&self, id: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.id == id)
    }

    pub fn finding_mut(&mut self, id: &str) -> Option<&mut Finding> {
        self.findings.iter_mut().find(|f| f.id == id)
    }

    pub fn finding_by_sequence(&self, sequence: u32) -> Option<&Finding> {
        self.findings.iter().find(|f| f.sequence == Some(sequence))
    }

    /// Findings sorted by sequence number; unsequenced findings are omitted.
    pub fn sequenced_findings(&self) -> Vec<&Finding> {
        let mut out: Vec<&Finding> = self.findings.iter().filter(|f| f.sequence.is_some()).collect();
        out.sort_by_key(|f| f.sequence);
        out
    }

    pub fn outcome_counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for finding in &self.findings {
            match finding.fix.state {
                FixState::Applied => counts.applied += 1,
                FixState::Failed => counts.failed += 1,
                FixState::Skipped => counts.skipped += 1,
                FixState::NotStarted | FixState::Applying => counts.pending += 1,
            }
        }
        counts
    }

    /// Agent cost spent so far, split into analysis and fix attempts.
    pub fn cost(&self) -> AgentCost {
        AgentCost {
            analysis_usd: self.reviewers.iter().map(|r| r.cost_usd).sum(),
            fixes_usd: self.findings.iter().filter_map(|f| f.fix.cost_usd).sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AgentCost {
    pub analysis_usd: f64,
    pub fixes_usd: f64,
}

impl AgentCost {
    pub fn total_usd(&self) -> f64 {
        self.analysis_usd + self.fixes_usd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutcomeCounts {
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Lowercase, hyphen-separated slug limited to 40 characters.
pub fn slugify(text: &str) -> String {
    let mut result = String::new();
    let mut prev_hyphen = false;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c);
            prev_hyphen = false;
        } else if !prev_hyphen && !result.is_empty() {
            result.push('-');
            prev_hyphen = true;
        }
    }
    if result.len() > 40 {
        result.truncate(40);
    }
    while result.ends_with('-') {
        result.pop();
    }
    result
}
