use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Validated reviewer identifier: `[a-z0-9][a-z0-9_-]*`, at most 64 chars.
///
/// The set of valid ids is config-driven, so use sites check membership
/// against the loaded [`ReviewerRegistry`] via [`ReviewerRegistry::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReviewerId(String);

impl ReviewerId {
    pub fn parse(raw: &str) -> Result<Self> {
        let valid_start = raw
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        let valid_rest = raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid_start || !valid_rest || raw.len() > 64 {
            return Err(Error::Configuration(format!(
                "invalid reviewer id '{raw}' (allowed: a-z0-9_-, starting with a letter or digit)"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Derive an id from a definition file stem: lowercased, spaces and dots
    /// mapped to `_`.
    pub fn from_file_stem(stem: &str) -> Result<Self> {
        let normalized: String = stem
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '.' { '_' } else { c })
            .collect();
        Self::parse(&normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReviewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ReviewerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ReviewerId> for String {
    fn from(id: ReviewerId) -> Self {
        id.0
    }
}

/// One reviewer persona. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewerDefinition {
    pub id: ReviewerId,
    pub title: String,
    pub prompt: String,
    pub tools: Vec<String>,
    pub report_only: bool,
    pub enabled: bool,
    /// Runs deepening passes over its own exploration entries.
    pub explore: bool,
    pub source: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FrontMatter {
    title: Option<String>,
    #[serde(default = "default_tools")]
    tools: Vec<String>,
    #[serde(default)]
    report_only: bool,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    explore: bool,
}

fn default_tools() -> Vec<String> {
    vec!["Read".to_string(), "Grep".to_string(), "Glob".to_string()]
}

fn default_enabled() -> bool {
    true
}

/// Split a `---` fenced header from the document body.
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((header, body.trim_start_matches(['\n', '\r'])));
        }
        offset += line.len();
    }
    None
}

/// Parse a single reviewer document.
pub fn parse_definition(path: &Path, content: &str) -> Result<ReviewerDefinition> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Configuration(format!("bad reviewer file name: {}", path.display())))?;
    let id = ReviewerId::from_file_stem(stem)?;

    let (header, body) = split_front_matter(content).ok_or_else(|| {
        Error::Configuration(format!("{}: missing front-matter header", path.display()))
    })?;

    let front: FrontMatter = serde_yaml::from_str(header).map_err(|e| {
        Error::Configuration(format!("{}: malformed front-matter: {e}", path.display()))
    })?;

    let title = front
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            Error::Configuration(format!("{}: front-matter is missing 'title'", path.display()))
        })?;

    Ok(ReviewerDefinition {
        id,
        title,
        prompt: body.to_string(),
        tools: front.tools,
        report_only: front.report_only,
        enabled: front.enabled,
        explore: front.explore,
        source: path.to_path_buf(),
    })
}

/// Reviewer definitions in registration order (sorted by file name).
#[derive(Debug, Clone)]
pub struct ReviewerRegistry {
    definitions: Vec<ReviewerDefinition>,
    index: HashMap<ReviewerId, usize>,
}

impl ReviewerRegistry {
    /// Load every `*.md` document in `dir`. Any malformed document or
    /// duplicate id fails the whole load.
    pub fn load_all(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Configuration(format!(
                "reviewers directory not found: {}",
                dir.display()
            )));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in &paths {
            let content = std::fs::read_to_string(path)?;
            let definition = parse_definition(path, &content)?;
            debug!(reviewer = %definition.id, path = %path.display(), "loaded reviewer definition");
            definitions.push(definition);
        }

        let registry = Self::from_definitions(definitions)?;
        info!(count = registry.definitions.len(), dir = %dir.display(), "reviewer registry loaded");
        Ok(registry)
    }

    pub fn from_definitions(definitions: Vec<ReviewerDefinition>) -> Result<Self> {
        if definitions.is_empty() {
            return Err(Error::Configuration("no reviewer definitions found".to_string()));
        }
        let mut index = HashMap::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            if let Some(prev) = index.insert(def.id.clone(), i) {
                return Err(Error::Configuration(format!(
                    "duplicate reviewer id '{}' ({} and {})",
                    def.id,
                    definitions[prev].source.display(),
                    def.source.display()
                )));
            }
        }
        Ok(Self { definitions, index })
    }

    /// Restrict the enabled set and mark extra reviewers report-only. Every
    /// named id must exist.
    pub fn with_selection(mut self, enabled: Option<&[String]>, report_only: &[String]) -> Result<Self> {
        if let Some(enabled) = enabled {
            let ids = enabled
                .iter()
                .map(|raw| self.resolve(raw))
                .collect::<Result<Vec<_>>>()?;
            for def in &mut self.definitions {
                def.enabled = ids.contains(&def.id);
            }
        }
        for raw in report_only {
            let id = self.resolve(raw)?;
            let i = self.index[&id];
            self.definitions[i].report_only = true;
        }
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&ReviewerDefinition> {
        let id = ReviewerId::parse(id).ok()?;
        self.index.get(&id).map(|&i| &self.definitions[i])
    }

    /// Validate a raw id against the loaded set.
    pub fn resolve(&self, raw: &str) -> Result<ReviewerId> {
        let id = ReviewerId::parse(raw)?;
        if self.index.contains_key(&id) {
            Ok(id)
        } else {
            Err(Error::Configuration(format!("unknown reviewer: {raw}")))
        }
    }

    pub fn all(&self) -> &[ReviewerDefinition] {
        &self.definitions
    }

    pub fn enabled(&self) -> Vec<&ReviewerDefinition> {
        self.definitions.iter().filter(|d| d.enabled).collect()
    }
}
