//! Re-resolution of analysis-time line numbers against current file content.
//!
//! A finding's stored line number goes stale as soon as an earlier fix in the
//! same file inserts or removes lines. The anchor captured at analysis time
//! (a few lines of surrounding text) lets the applier find where that code
//! lives now; the stored line only breaks ties.

use serde::{Deserialize, Serialize};

/// Lines captured on each side of the target line.
const ANCHOR_RADIUS: usize = 2;

/// Snapshot text around a finding's analysis-time line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub lines: Vec<String>,
    /// Index of the target line within `lines`.
    pub offset: usize,
}

impl Anchor {
    /// Capture the window around 1-based `line`. `None` when out of range.
    pub fn capture(content: &str, line: u32) -> Option<Self> {
        let all: Vec<&str> = content.lines().collect();
        let idx = (line as usize).checked_sub(1)?;
        if idx >= all.len() {
            return None;
        }
        let start = idx.saturating_sub(ANCHOR_RADIUS);
        let end = (idx + ANCHOR_RADIUS + 1).min(all.len());
        Some(Self {
            lines: all[start..end].iter().map(|l| l.to_string()).collect(),
            offset: idx - start,
        })
    }

    fn target_line(&self) -> Option<&str> {
        self.lines.get(self.offset).map(|l| l.trim())
    }

    fn is_blank(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// The whole anchor window matched.
    Anchored,
    /// Only the target line's text matched.
    LineText,
    /// Nothing matched; the stored hint was used.
    Hint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLocation {
    /// 1-based.
    pub line: u32,
    pub confidence: Confidence,
}

/// Find where the anchored code lives in `current`. Among several matches the
/// one nearest `hint` wins.
pub fn resolve_location(current: &str, anchor: Option<&Anchor>, hint: u32) -> ResolvedLocation {
    let lines: Vec<&str> = current.lines().map(str::trim).collect();

    if let Some(anchor) = anchor
        && !anchor.lines.is_empty()
        && !anchor.is_blank()
    {
        let window: Vec<&str> = anchor.lines.iter().map(|l| l.trim()).collect();
        let candidates = lines
            .windows(window.len())
            .enumerate()
            .filter(|(_, w)| *w == window.as_slice())
            .map(|(i, _)| i + anchor.offset + 1);
        if let Some(line) = nearest(candidates, hint) {
            return ResolvedLocation {
                line,
                confidence: Confidence::Anchored,
            };
        }

        if let Some(target) = anchor.target_line()
            && !target.is_empty()
        {
            let candidates = lines
                .iter()
                .enumerate()
                .filter(|(_, l)| **l == target)
                .map(|(i, _)| i + 1);
            if let Some(line) = nearest(candidates, hint) {
                return ResolvedLocation {
                    line,
                    confidence: Confidence::LineText,
                };
            }
        }
    }

    let max = lines.len().max(1) as u32;
    ResolvedLocation {
        line: hint.clamp(1, max),
        confidence: Confidence::Hint,
    }
}

fn nearest(candidates: impl Iterator<Item = usize>, hint: u32) -> Option<u32> {
    candidates
        .map(|line| line as u32)
        .min_by_key(|&line| (line.abs_diff(hint), line))
}
