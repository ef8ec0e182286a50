use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::agent::{AgentClient, FixReport, FixRequest, is_inside, snippet_around};
use crate::error::{Error, Result};
use crate::git::{self, GitOperations};
use crate::locate::resolve_location;
use crate::publish::OutcomeSink;
use crate::session::{ApplyMode, Finding, FixState, ReviewSession};
use crate::store::SessionHandle;

/// Lines of current content shown to the fix agent on each side.
const SNIPPET_RADIUS: usize = 8;

/// Result of one [`apply_next`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindingOutcome {
    pub sequence: u32,
    pub finding_id: String,
    pub state: FixState,
    pub commit: Option<String>,
    pub error: Option<String>,
    pub published: bool,
}

/// Commit subject identifying the fix for one finding.
pub fn commit_marker(sequence: u32, title: &str) -> String {
    let title = title.lines().next().unwrap_or_default().trim();
    format!("[review] ({sequence}) {title}")
}

pub fn session_trailer(session_id: &str) -> String {
    format!("Review-Session: {session_id}")
}

/// Terminal outcome of one fix attempt, before it is recorded.
struct Attempt {
    state: FixState,
    file: Option<String>,
    line: Option<u32>,
    commit: Option<String>,
    error: Option<String>,
    cost_usd: Option<f64>,
}

impl Attempt {
    fn skipped() -> Self {
        Self {
            state: FixState::Skipped,
            file: None,
            line: None,
            commit: None,
            error: None,
            cost_usd: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            state: FixState::Failed,
            file: None,
            line: None,
            commit: None,
            error: Some(error.into()),
            cost_usd: None,
        }
    }

    fn costing(mut self, cost_usd: Option<f64>) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

/// Advance the fix loop by exactly one finding: the one after the durable
/// cursor. Returns `None` once every sequenced finding has been processed.
///
/// The outcome is recorded before the sink sees it, and the cursor only
/// moves after publication was acknowledged or given up on, so a crash at
/// any point resumes on the same finding without repeating finished work.
/// Per-finding failures are recorded, never returned; only store and
/// working-tree cleanup failures are errors.
pub async fn apply_next<A, G, S>(
    handle: &SessionHandle,
    agent: &A,
    git: &Arc<G>,
    sink: &S,
) -> Result<Option<FindingOutcome>>
where
    A: AgentClient,
    G: GitOperations + 'static,
    S: OutcomeSink,
{
    let session = handle.snapshot()?;
    let sequence = session.fix_cursor + 1;
    let Some(finding) = session.finding_by_sequence(sequence).cloned() else {
        debug!(cursor = session.fix_cursor, "no findings left to apply");
        return Ok(None);
    };

    if !finding.fix.state.is_terminal() {
        let attempt = attempt_fix(handle, &session, &finding, agent, git).await?;
        record(handle, &finding.id, attempt)?;
    }

    let session = handle.snapshot()?;
    let finding = session
        .finding(&finding.id)
        .cloned()
        .ok_or_else(|| Error::Store(format!("finding vanished: {}", finding.id)))?;

    let published = if finding.fix.published {
        true
    } else {
        match sink.publish(&session, &finding).await {
            Ok(()) => true,
            Err(e) => {
                handle.warn(format!("could not publish outcome of finding {sequence}: {e}"))?;
                false
            }
        }
    };

    handle.update(|s| {
        if let Some(f) = s.finding_mut(&finding.id) {
            f.fix.published = published;
        }
        s.fix_cursor = sequence;
        Ok(())
    })?;

    info!(
        sequence,
        finding = %finding.id,
        state = %finding.fix.state,
        published,
        "finding processed"
    );
    Ok(Some(FindingOutcome {
        sequence,
        finding_id: finding.id,
        state: finding.fix.state,
        commit: finding.fix.commit,
        error: finding.fix.error,
        published,
    }))
}

async fn attempt_fix<A: AgentClient, G: GitOperations + 'static>(
    handle: &SessionHandle,
    session: &ReviewSession,
    finding: &Finding,
    agent: &A,
    git: &Arc<G>,
) -> Result<Attempt> {
    let sequence = finding.sequence.unwrap_or_default();
    if finding.report_only || session.mode == ApplyMode::Report {
        debug!(sequence, finding = %finding.id, "report-only finding, skipping");
        return Ok(Attempt::skipped());
    }

    let marker = commit_marker(sequence, &finding.title);
    let trailer = session_trailer(&session.id);

    if finding.fix.state == FixState::Applying {
        // Interrupted mid-fix: the commit either landed or it did not.
        let patterns = [marker.clone(), trailer.clone()];
        let found = git::blocking(git, move |g| g.find_commit(&[patterns[0].as_str(), patterns[1].as_str()])).await?;
        if let Some(commit) = found {
            info!(sequence, commit = %commit, "fix commit found from interrupted run");
            return Ok(Attempt {
                state: FixState::Applied,
                file: finding.fix.file.clone().or_else(|| Some(finding.file.clone())),
                line: finding.fix.line,
                commit: Some(commit),
                error: None,
                cost_usd: finding.fix.cost_usd,
            });
        }
        info!(sequence, "no fix commit from interrupted run, retrying");
        git::blocking(git, |g| g.discard_changes()).await?;
    } else {
        handle.update_finding(&finding.id, |f| f.fix.state = FixState::Applying)?;
    }

    let workdir = git.workdir();
    if !is_inside(workdir, &finding.file) {
        return Ok(Attempt::failed(format!(
            "file is outside the working tree: {}",
            finding.file
        )));
    }
    let content = match std::fs::read_to_string(workdir.join(&finding.file)) {
        Ok(content) => content,
        Err(e) => return Ok(Attempt::failed(format!("cannot read {}: {e}", finding.file))),
    };

    let location = resolve_location(&content, finding.anchor.as_ref(), finding.line);
    if location.line != finding.line {
        info!(
            sequence,
            file = %finding.file,
            from = finding.line,
            to = location.line,
            confidence = ?location.confidence,
            "location re-resolved"
        );
    }
    handle.update_finding(&finding.id, |f| {
        f.fix.file = Some(f.file.clone());
        f.fix.line = Some(location.line);
    })?;

    let request = FixRequest {
        sequence,
        finding: finding.clone(),
        location,
        snippet: snippet_around(&content, location.line, SNIPPET_RADIUS),
        workdir: workdir.to_path_buf(),
    };

    let report = match agent.apply_fix(&request).await {
        Ok(report) => report,
        Err(e) => {
            warn!(sequence, error = %e, "fix agent failed");
            git::blocking(git, |g| g.discard_changes()).await?;
            return Ok(Attempt::failed(e.to_string()));
        }
    };

    let message = format!("{marker}\n\n{}", commit_body(finding, &report, &trailer));
    match git::blocking(git, move |g| g.commit_all(&message)).await {
        Ok(Some(commit)) => {
            let (file, line) = touched_location(workdir, finding, &report, location.line);
            info!(sequence, commit = %commit, file = %file, line, "fix applied");
            Ok(Attempt {
                state: FixState::Applied,
                file: Some(file),
                line: Some(line),
                commit: Some(commit),
                error: None,
                cost_usd: report.cost_usd,
            })
        }
        Ok(None) => {
            warn!(sequence, "fix agent produced no changes");
            Ok(Attempt::failed("no changes produced").costing(report.cost_usd))
        }
        Err(e) => {
            warn!(sequence, error = %e, "commit failed");
            git::blocking(git, |g| g.discard_changes()).await?;
            Ok(Attempt::failed(Error::Apply(e.to_string()).to_string()).costing(report.cost_usd))
        }
    }
}

fn commit_body(finding: &Finding, report: &FixReport, trailer: &str) -> String {
    let summary = report
        .summary
        .as_deref()
        .or(finding.fix_summary.as_deref())
        .unwrap_or(&finding.description);
    format!("{}\n\nReviewer: {}\n{trailer}", summary.trim(), finding.reviewer)
}

/// Where the agent says it edited, falling back to the resolved location.
fn touched_location(workdir: &Path, finding: &Finding, report: &FixReport, resolved: u32) -> (String, u32) {
    let file = report
        .file
        .as_deref()
        .map(|f| f.trim_start_matches("./"))
        .filter(|f| is_inside(workdir, f))
        .unwrap_or(&finding.file)
        .to_string();
    let line = report.line.filter(|l| *l > 0).unwrap_or(resolved);
    (file, line)
}

fn record(handle: &SessionHandle, id: &str, attempt: Attempt) -> Result<()> {
    handle.update_finding(id, |f| {
        f.fix.state = attempt.state;
        if attempt.file.is_some() {
            f.fix.file = attempt.file;
        }
        if attempt.line.is_some() {
            f.fix.line = attempt.line;
        }
        f.fix.commit = attempt.commit;
        f.fix.error = attempt.error;
        f.fix.cost_usd = attempt.cost_usd;
        f.fix.published = false;
    })
}

/// Publish every processed finding whose outcome was never acknowledged.
/// Returns how many are still unacknowledged.
pub async fn publish_pending<S: OutcomeSink>(handle: &SessionHandle, sink: &S) -> Result<usize> {
    let session = handle.snapshot()?;
    let pending: Vec<Finding> = session
        .sequenced_findings()
        .into_iter()
        .filter(|f| f.sequence.is_some_and(|s| s <= session.fix_cursor))
        .filter(|f| f.fix.state.is_terminal() && !f.fix.published)
        .cloned()
        .collect();

    let mut remaining = 0;
    for finding in pending {
        match sink.publish(&session, &finding).await {
            Ok(()) => handle.update_finding(&finding.id, |f| f.fix.published = true)?,
            Err(e) => {
                remaining += 1;
                handle.warn(format!("could not publish outcome of {}: {e}", finding.id))?;
            }
        }
    }
    Ok(remaining)
}
