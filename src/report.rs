use std::fmt::Write as _;

use crate::error::Result;
use crate::session::{FixState, ReviewSession, ReviewerState};
use crate::store::SessionHandle;

/// Markdown report of a session: every reviewer's status and every
/// finding's application state, failures included.
pub fn render_report(session: &ReviewSession) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Review session `{}`\n", session.id);
    let _ = writeln!(out, "- target: `{}`", session.target);
    let _ = writeln!(out, "- base: `{}`", session.base);
    let _ = writeln!(out, "- phase: {}", session.phase);
    let _ = writeln!(out, "- mode: {}", session.mode);
    if let Some(ref branch) = session.fix_branch {
        let _ = writeln!(out, "- fix branch: `{branch}`");
    }
    if let Some(ref tracking) = session.tracking {
        let _ = writeln!(out, "- tracking request: #{} {}", tracking.number, tracking.url);
    }
    if let Some(ref fault) = session.fault {
        let _ = writeln!(out, "- fault during {}: {}", fault.phase, fault.message);
    }
    let cost = session.cost();
    if cost.total_usd() > 0.0 {
        let _ = writeln!(
            out,
            "- agent cost: ${:.4} (analysis ${:.4}, fixes ${:.4})",
            cost.total_usd(),
            cost.analysis_usd,
            cost.fixes_usd
        );
    }

    let succeeded = session
        .reviewers
        .iter()
        .filter(|r| r.state == ReviewerState::Succeeded)
        .count();
    let _ = writeln!(
        out,
        "\n## Reviewers ({succeeded}/{} succeeded)\n",
        session.reviewers.len()
    );
    for status in &session.reviewers {
        let _ = write!(out, "- `{}`: {}", status.reviewer, status.state);
        if status.state == ReviewerState::Succeeded {
            let _ = write!(out, ", {} finding(s)", status.findings_count);
        }
        if status.cost_usd > 0.0 {
            let _ = write!(out, ", ${:.4}", status.cost_usd);
        }
        if let Some(ref error) = status.error {
            let _ = write!(out, " ({})", first_line(error));
        }
        out.push('\n');
    }

    let counts = session.outcome_counts();
    let _ = writeln!(
        out,
        "\n## Findings ({} applied, {} failed, {} skipped, {} pending)\n",
        counts.applied, counts.failed, counts.skipped, counts.pending
    );
    let sequenced = session.sequenced_findings();
    if session.findings.is_empty() {
        out.push_str("No findings.\n");
    }
    for finding in &sequenced {
        let _ = write!(
            out,
            "{}. **{}** [{}] `{}:{}`: {}",
            finding.sequence.unwrap_or_default(),
            finding.title,
            finding.reviewer,
            finding.file,
            finding.line,
            finding.fix.state
        );
        match finding.fix.state {
            FixState::Applied => {
                if let Some(ref commit) = finding.fix.commit {
                    let _ = write!(out, " in {commit}");
                }
                if let (Some(file), Some(line)) = (&finding.fix.file, finding.fix.line) {
                    let _ = write!(out, " at `{file}:{line}`");
                }
            }
            FixState::Failed => {
                if let Some(ref error) = finding.fix.error {
                    let _ = write!(out, " ({})", first_line(error));
                }
            }
            _ => {}
        }
        if finding.fix.state.is_terminal() && !finding.fix.published && session.tracking.is_some() {
            out.push_str(" (not published)");
        }
        out.push('\n');
    }
    // Findings recorded but never sequenced (analysis did not complete).
    for finding in session.findings.iter().filter(|f| f.sequence.is_none()) {
        let _ = writeln!(
            out,
            "- **{}** [{}] `{}:{}`: unsequenced",
            finding.title, finding.reviewer, finding.file, finding.line
        );
    }

    if !session.warnings.is_empty() {
        out.push_str("\n## Warnings\n\n");
        for warning in &session.warnings {
            let _ = writeln!(out, "- {}", first_line(warning));
        }
    }
    out
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}

/// Render and write `report.md` into the session directory.
pub fn write_report(handle: &SessionHandle) -> Result<String> {
    let report = render_report(&handle.snapshot()?);
    std::fs::write(handle.report_path(), &report)?;
    Ok(report)
}
