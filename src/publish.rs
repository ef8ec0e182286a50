use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::session::{Finding, FixState, ReviewSession, TrackingRef};

/// Base delay for publish retries; doubles per attempt.
pub const PUBLISH_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Marker identifying the tracking request body.
pub const SUMMARY_MARKER: &str = "<!-- revfix-summary -->";

/// Hidden marker tying a comment to one finding of one session.
pub fn finding_marker(session_id: &str, finding_id: &str) -> String {
    format!("<!-- revfix:{session_id}:{finding_id} -->")
}

/// Hosting-side publication of review progress. Every call must be safe to
/// repeat after a crash.
pub trait Publisher: Send + Sync {
    /// Open (or find the already open) draft request for `branch`.
    fn create_tracking(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<TrackingRef>;

    /// Post `body` unless a comment carrying `marker` already exists.
    fn publish_outcome(&self, tracking: &TrackingRef, marker: &str, body: &str) -> Result<()>;

    fn update_summary(&self, tracking: &TrackingRef, body: &str) -> Result<()>;

    fn mark_ready(&self, tracking: &TrackingRef) -> Result<()>;
}

/// GitHub publication via the `gh` CLI.
pub struct GhPublisher {
    repo_root: PathBuf,
}

impl GhPublisher {
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    fn gh(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| Error::Publish(format!("failed to run gh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Publish(format!(
                "gh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn find_open_request(&self, branch: &str) -> Result<Option<TrackingRef>> {
        let stdout = self.gh(&[
            "pr", "list", "--head", branch, "--state", "open", "--json", "number,url", "--limit", "1",
        ])?;
        let prs: Vec<serde_json::Value> = serde_json::from_str(&stdout)
            .map_err(|e| Error::Publish(format!("failed to parse gh output: {e}")))?;

        if let Some(pr) = prs.first()
            && let Some(number) = pr.get("number").and_then(|v| v.as_u64())
            && let Some(url) = pr.get("url").and_then(|v| v.as_str())
        {
            return Ok(Some(TrackingRef {
                number,
                url: url.to_string(),
            }));
        }
        Ok(None)
    }

    fn has_comment_with(&self, tracking: &TrackingRef, marker: &str) -> Result<bool> {
        let number = tracking.number.to_string();
        let stdout = self.gh(&["pr", "view", &number, "--json", "comments"])?;
        let view: serde_json::Value = serde_json::from_str(&stdout)
            .map_err(|e| Error::Publish(format!("failed to parse gh output: {e}")))?;
        Ok(view
            .get("comments")
            .and_then(|c| c.as_array())
            .is_some_and(|comments| {
                comments.iter().any(|c| {
                    c.get("body")
                        .and_then(|b| b.as_str())
                        .is_some_and(|b| b.contains(marker))
                })
            }))
    }
}

impl Publisher for GhPublisher {
    fn create_tracking(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<TrackingRef> {
        if let Some(existing) = self.find_open_request(branch)? {
            info!(url = %existing.url, "found existing tracking request");
            return Ok(existing);
        }

        let stdout = self.gh(&[
            "pr", "create", "--draft", "--head", branch, "--base", base, "--title", title, "--body",
            body,
        ])?;
        let url = stdout.trim().to_string();
        let number = parse_request_number(&url)
            .ok_or_else(|| Error::Publish(format!("unexpected gh pr create output: {url}")))?;
        info!(url = %url, "created tracking request");
        Ok(TrackingRef { number, url })
    }

    fn publish_outcome(&self, tracking: &TrackingRef, marker: &str, body: &str) -> Result<()> {
        if self.has_comment_with(tracking, marker)? {
            info!(pr = tracking.number, "outcome comment already posted");
            return Ok(());
        }
        let number = tracking.number.to_string();
        self.gh(&["pr", "comment", &number, "--body", body])?;
        Ok(())
    }

    fn update_summary(&self, tracking: &TrackingRef, body: &str) -> Result<()> {
        let number = tracking.number.to_string();
        self.gh(&["pr", "edit", &number, "--body", body])?;
        Ok(())
    }

    fn mark_ready(&self, tracking: &TrackingRef) -> Result<()> {
        let number = tracking.number.to_string();
        self.gh(&["pr", "ready", &number])?;
        Ok(())
    }
}

/// `https://github.com/o/r/pull/123` -> 123
fn parse_request_number(url: &str) -> Option<u64> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

/// Run `op` up to `attempts` times with exponential backoff from `base_delay`.
/// Each attempt runs on the blocking pool.
pub async fn with_retry<T, F>(attempts: u32, base_delay: Duration, what: &str, op: F) -> Result<T>
where
    T: Send + 'static,
    F: Fn() -> Result<T> + Send + Sync + 'static,
{
    let attempts = attempts.max(1);
    let op = Arc::new(op);
    let mut delay = base_delay;
    for attempt in 1..=attempts {
        let op = Arc::clone(&op);
        let result = tokio::task::spawn_blocking(move || op())
            .await
            .map_err(|e| Error::Publish(format!("{what} task failed: {e}")))?;
        match result {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts => {
                warn!(attempt, max = attempts, error = %e, "{what} failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => {
                return Err(Error::Publish(format!(
                    "{what} failed after {attempts} attempts: {e}"
                )));
            }
        }
    }
    unreachable!("loop returns on the final attempt")
}

/// Receives each finding outcome from the fix applier, in sequence order.
pub trait OutcomeSink: Send + Sync {
    fn publish(&self, session: &ReviewSession, finding: &Finding) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// [`OutcomeSink`] that comments on the tracking request, with retries.
/// Without a tracking request every outcome is acknowledged locally.
pub struct PublishSink<P> {
    publisher: Arc<P>,
    attempts: u32,
    base_delay: Duration,
}

impl<P: Publisher + 'static> PublishSink<P> {
    pub fn new(publisher: Arc<P>, attempts: u32) -> Self {
        Self {
            publisher,
            attempts,
            base_delay: PUBLISH_BACKOFF_BASE,
        }
    }

    pub fn with_backoff(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }
}

/// Posts the outcome comment, then refreshes the summary table. A stale
/// summary does not block acknowledgement; the next outcome or finalization
/// rewrites it.
impl<P: Publisher + 'static> OutcomeSink for PublishSink<P> {
    async fn publish(&self, session: &ReviewSession, finding: &Finding) -> Result<()> {
        let Some(ref tracking) = session.tracking else {
            return Ok(());
        };
        let marker = finding_marker(&session.id, &finding.id);
        let body = render_outcome_comment(&marker, finding);
        let what = format!("publishing outcome for {}", finding.id);
        let publisher = Arc::clone(&self.publisher);
        let target = tracking.clone();
        with_retry(self.attempts, self.base_delay, &what, move || {
            publisher.publish_outcome(&target, &marker, &body)
        })
        .await?;

        let publisher = Arc::clone(&self.publisher);
        let target = tracking.clone();
        let summary = render_summary(session);
        if let Err(e) = with_retry(self.attempts, self.base_delay, "updating summary", move || {
            publisher.update_summary(&target, &summary)
        })
        .await
        {
            warn!(finding = %finding.id, error = %e, "summary not refreshed");
        }
        Ok(())
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

pub fn tracking_title(session: &ReviewSession) -> String {
    format!("Review fixes for {}", session.target)
}

/// Request body: intro plus the summary table keyed by sequence number.
pub fn render_summary(session: &ReviewSession) -> String {
    let counts = session.outcome_counts();
    let mut out = String::new();
    out.push_str(SUMMARY_MARKER);
    out.push_str(&format!(
        "\n## Automated review of `{}`\n\nSession `{}` against `{}`: {} finding(s), {} applied, {} failed, {} skipped, {} pending.\n\n",
        session.target,
        session.id,
        session.base,
        session.findings.len(),
        counts.applied,
        counts.failed,
        counts.skipped,
        counts.pending
    ));
    out.push_str(&render_summary_table(session));
    out
}

pub fn render_summary_table(session: &ReviewSession) -> String {
    let mut out = String::from("| # | reviewer | title | file | line | state |\n|---|---|---|---|---|---|\n");
    for finding in session.sequenced_findings() {
        let line = finding.fix.line.unwrap_or(finding.line);
        let file = finding.fix.file.as_deref().unwrap_or(&finding.file);
        out.push_str(&format!(
            "| {} | {} | {} | `{}` | {} | {} |\n",
            finding.sequence.unwrap_or_default(),
            finding.reviewer,
            escape_cell(&finding.title),
            escape_cell(file),
            line,
            finding.fix.state
        ));
    }
    out
}

pub fn render_outcome_comment(marker: &str, finding: &Finding) -> String {
    let seq = finding.sequence.unwrap_or_default();
    let headline = match finding.fix.state {
        FixState::Applied => format!(
            "**Fixed ({seq}): {}**{}",
            finding.title,
            finding
                .fix
                .commit
                .as_deref()
                .map(|c| format!(" in {c}"))
                .unwrap_or_default()
        ),
        FixState::Failed => format!("**Could not fix ({seq}): {}**", finding.title),
        FixState::Skipped => format!("**Reported ({seq}): {}**", finding.title),
        FixState::NotStarted | FixState::Applying => format!("**Pending ({seq}): {}**", finding.title),
    };

    let mut out = format!("{marker}\n{headline}\n\n");
    let file = finding.fix.file.as_deref().unwrap_or(&finding.file);
    let line = finding.fix.line.unwrap_or(finding.line);
    out.push_str(&format!("`{file}` line {line} · reviewer `{}`\n\n", finding.reviewer));
    out.push_str(finding.fix_summary.as_deref().unwrap_or(&finding.description));
    out.push('\n');
    if let Some(ref scenario) = finding.scenario {
        out.push_str(&format!("\n<details><summary>Scenario</summary>\n\n{scenario}\n\n</details>\n"));
    }
    if let Some(ref error) = finding.fix.error {
        out.push_str(&format!("\n> {}\n", error.replace('\n', "\n> ")));
    }
    out
}
