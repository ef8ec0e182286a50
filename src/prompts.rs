use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::session::{ChangedFile, FileStatus};

const DEFAULT_ANALYZE: &str = include_str!("default_prompts/analyze.md");
const DEFAULT_FIX: &str = include_str!("default_prompts/fix.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Analyze,
    Fix,
}

impl PromptKind {
    fn default_template(self) -> &'static str {
        match self {
            PromptKind::Analyze => DEFAULT_ANALYZE,
            PromptKind::Fix => DEFAULT_FIX,
        }
    }

    fn filename(self) -> String {
        format!("{self}.md")
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptKind::Analyze => write!(f, "analyze"),
            PromptKind::Fix => write!(f, "fix"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewerVars {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileVars {
    pub path: String,
    pub status: FileStatus,
    pub additions: u32,
    pub deletions: u32,
}

impl From<&ChangedFile> for FileVars {
    fn from(f: &ChangedFile) -> Self {
        Self {
            path: f.path.clone(),
            status: f.status,
            additions: f.additions,
            deletions: f.deletions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FocusVars {
    pub target: String,
    pub reason: String,
    pub depth: u32,
    pub content: Option<String>,
}

/// A target this reviewer already queued for exploration.
#[derive(Debug, Clone, Serialize)]
pub struct QueueVars {
    pub target: String,
    pub reason: String,
    pub depth: u32,
    pub inspected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeVars {
    pub reviewer: ReviewerVars,
    pub target: String,
    pub base: String,
    pub diff: String,
    pub files: Vec<FileVars>,
    pub explore: bool,
    pub max_depth: u32,
    pub focus: Option<FocusVars>,
    pub queue: Vec<QueueVars>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixVars {
    pub sequence: u32,
    pub title: String,
    pub description: String,
    pub scenario: Option<String>,
    pub fix_plan: String,
    pub file: String,
    pub line: u32,
    pub hint_line: u32,
    pub confidence: String,
    pub snippet: String,
}

/// Prompt templates (`upon` syntax) with embedded defaults and user overrides.
pub struct PromptEngine {
    override_dir: Option<PathBuf>,
    engine: upon::Engine<'static>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        Self {
            override_dir,
            engine: upon::Engine::new(),
        }
    }

    /// User overrides in `override_dir` take precedence over defaults.
    pub fn load_template(&self, kind: PromptKind) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(kind.filename());
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                });
            }
        }
        Ok(kind.default_template().to_string())
    }

    pub fn render<S: Serialize>(&self, kind: PromptKind, vars: &S) -> Result<String> {
        let source = self.load_template(kind)?;
        let template = self
            .engine
            .compile(source)
            .map_err(|e| Error::Prompt(format!("invalid {kind} template: {e}")))?;
        template
            .render(&self.engine, vars)
            .to_string()
            .map_err(|e| Error::Prompt(format!("failed to render {kind} template: {e}")))
    }
}
