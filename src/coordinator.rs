use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::AgentClient;
use crate::context::{AnalysisContext, ChangeSnapshot, Focus};
use crate::error::{Error, Result};
use crate::exploration::ExplorationEntry;
use crate::git::{self, GitOperations};
use crate::locate::Anchor;
use crate::registry::{ReviewerDefinition, ReviewerId, ReviewerRegistry};
use crate::schema::{AnalysisOutput, FollowUp, ReportedFinding};
use crate::session::{FixRecord, Finding, ReviewerState};
use crate::store::SessionHandle;

/// Follow-up targets accepted from a single analysis pass.
const MAX_FOLLOW_UPS_PER_PASS: usize = 8;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub max_concurrency: usize,
    pub unit_timeout: Duration,
    pub max_depth: u32,
    /// Relaunch reviewers a previous run recorded as failed.
    pub retry_failed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Left pending because cancellation arrived before they started.
    pub not_started: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Succeeded,
    Failed,
    NotStarted,
}

/// Runs every enabled reviewer concurrently against one frozen snapshot.
///
/// Reviewer failures are recorded on the reviewer's status and never affect
/// siblings. Only store failures abort the run.
pub struct AnalysisCoordinator<A, G> {
    agent: Arc<A>,
    git: Arc<G>,
    options: CoordinatorOptions,
}

impl<A, G> AnalysisCoordinator<A, G>
where
    A: AgentClient + 'static,
    G: GitOperations + 'static,
{
    pub fn new(agent: Arc<A>, git: Arc<G>, options: CoordinatorOptions) -> Self {
        Self { agent, git, options }
    }

    pub async fn run(
        &self,
        handle: &SessionHandle,
        registry: &ReviewerRegistry,
        snapshot: Arc<ChangeSnapshot>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<AnalysisSummary> {
        let session = handle.snapshot()?;
        let mut launch = Vec::new();
        for status in &session.reviewers {
            match status.state {
                ReviewerState::Succeeded => continue,
                ReviewerState::Failed if !self.options.retry_failed => continue,
                ReviewerState::Pending => {}
                ReviewerState::Running | ReviewerState::Failed => {
                    info!(reviewer = %status.reviewer, state = %status.state, "relaunching reviewer");
                    reset_reviewer(handle, &status.reviewer)?;
                }
            }
            let Some(def) = registry.get(status.reviewer.as_str()) else {
                warn!(reviewer = %status.reviewer, "reviewer definition no longer loaded");
                handle.set_reviewer_status(
                    &status.reviewer,
                    ReviewerState::Failed,
                    Some("reviewer definition is no longer loaded".to_string()),
                )?;
                continue;
            };
            launch.push(Arc::new(def.clone()));
        }

        let mut summary = AnalysisSummary::default();
        if launch.is_empty() {
            info!("no reviewers left to run");
            return Ok(summary);
        }

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut join_set = JoinSet::new();
        let mut task_reviewers: HashMap<tokio::task::Id, ReviewerId> = HashMap::new();

        info!(
            reviewers = launch.len(),
            max_concurrency = self.options.max_concurrency,
            "starting analysis"
        );
        for def in launch {
            let unit = Unit {
                handle: handle.clone(),
                id: def.id.clone(),
                def,
                agent: Arc::clone(&self.agent),
                git: Arc::clone(&self.git),
                snapshot: Arc::clone(&snapshot),
                options: self.options.clone(),
                semaphore: Arc::clone(&semaphore),
                shutdown: shutdown.cloned(),
            };
            let id = unit.id.clone();
            let abort = join_set.spawn(unit.run());
            task_reviewers.insert(abort.id(), id);
        }

        let mut fatal: Option<Error> = None;
        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((_, Ok(UnitOutcome::Succeeded))) => summary.succeeded += 1,
                Ok((_, Ok(UnitOutcome::Failed))) => summary.failed += 1,
                Ok((_, Ok(UnitOutcome::NotStarted))) => summary.not_started += 1,
                Ok((task, Err(e))) => {
                    warn!(reviewer = ?task_reviewers.get(&task), error = %e, "analysis unit hit a store failure");
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    let reviewer = task_reviewers.get(&e.id()).cloned();
                    warn!(reviewer = ?reviewer, error = %e, "analysis task panicked");
                    summary.failed += 1;
                    if let Some(reviewer) = reviewer {
                        handle.set_reviewer_status(
                            &reviewer,
                            ReviewerState::Failed,
                            Some(format!("analysis task panicked: {e}")),
                        )?;
                    }
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            not_started = summary.not_started,
            "analysis finished"
        );
        Ok(summary)
    }
}

/// Drop a reviewer's partial output so it can run again from scratch.
fn reset_reviewer(handle: &SessionHandle, reviewer: &ReviewerId) -> Result<()> {
    handle.update(|s| {
        s.findings.retain(|f| &f.reviewer != reviewer);
        s.exploration.remove_origin(reviewer);
        if let Some(status) = s.reviewer_mut(reviewer) {
            status.state = ReviewerState::Pending;
            status.error = None;
            status.findings_count = 0;
            status.cost_usd = 0.0;
        }
        Ok(())
    })
}

struct Unit<A, G> {
    handle: SessionHandle,
    id: ReviewerId,
    def: Arc<ReviewerDefinition>,
    agent: Arc<A>,
    git: Arc<G>,
    snapshot: Arc<ChangeSnapshot>,
    options: CoordinatorOptions,
    semaphore: Arc<Semaphore>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<A: AgentClient, G: GitOperations + 'static> Unit<A, G> {
    async fn run(self) -> Result<UnitOutcome> {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return Ok(UnitOutcome::NotStarted);
        };
        if self.shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
            info!(reviewer = %self.id, "cancellation requested, not starting reviewer");
            return Ok(UnitOutcome::NotStarted);
        }

        self.handle
            .set_reviewer_status(&self.id, ReviewerState::Running, None)?;
        info!(reviewer = %self.id, "reviewer started");

        let deadline = Instant::now() + self.options.unit_timeout;
        let mut cost = 0.0;
        let result = self.analyze(deadline, &mut cost).await;
        match result {
            Ok(findings) => {
                let count = findings.len();
                self.handle.update(|s| {
                    for finding in findings {
                        if s.finding(&finding.id).is_some() {
                            return Err(Error::Store(format!("duplicate finding id: {}", finding.id)));
                        }
                        s.findings.push(finding);
                    }
                    if let Some(status) = s.reviewer_mut(&self.id) {
                        status.state = ReviewerState::Succeeded;
                        status.error = None;
                        status.findings_count = count as u32;
                        status.cost_usd = cost;
                    }
                    Ok(())
                })?;
                info!(reviewer = %self.id, findings = count, cost_usd = cost, "reviewer succeeded");
                Ok(UnitOutcome::Succeeded)
            }
            Err(e @ Error::Store(_)) => Err(e),
            Err(e) => {
                warn!(reviewer = %self.id, error = %e, "reviewer failed");
                self.handle.update(|s| {
                    if let Some(status) = s.reviewer_mut(&self.id) {
                        status.state = ReviewerState::Failed;
                        status.error = Some(e.to_string());
                        status.cost_usd = cost;
                    }
                    Ok(())
                })?;
                Ok(UnitOutcome::Failed)
            }
        }
    }

    /// Every pass's cost is added to `cost` as soon as the pass returns.
    async fn analyze(&self, deadline: Instant, cost: &mut f64) -> Result<Vec<Finding>> {
        let mut extra_files: HashMap<String, Option<String>> = HashMap::new();

        let context = self.context()?;
        let first = self.call(&context, deadline).await?;
        *cost += first.cost_usd.unwrap_or_default();
        let mut reported = first.findings;

        if self.def.explore {
            self.enqueue(None, &first.follow_up)?;
            loop {
                let next = self
                    .handle
                    .update(|s| Ok(s.exploration.pop_next(Some(&self.id))))?;
                let Some(entry) = next else { break };
                debug!(reviewer = %self.id, target = %entry.target, depth = entry.depth, "exploring");

                let content = self.file_content(&entry.target, &mut extra_files).await;
                let context = self.context()?.with_focus(Focus {
                    entry: entry.clone(),
                    content,
                });
                let pass = self.call(&context, deadline).await?;
                *cost += pass.cost_usd.unwrap_or_default();
                reported.extend(pass.findings);
                self.enqueue(Some(&entry), &pass.follow_up)?;
            }
        }

        Ok(self.to_findings(reported, &mut extra_files).await)
    }

    fn context(&self) -> Result<AnalysisContext> {
        let exploration = self.handle.snapshot()?.exploration.entries().to_vec();
        Ok(AnalysisContext::new(
            Arc::clone(&self.snapshot),
            exploration,
            self.options.max_depth,
        ))
    }

    async fn call(&self, context: &AnalysisContext, deadline: Instant) -> Result<AnalysisOutput> {
        tokio::time::timeout_at(deadline, self.agent.analyze(&self.def, context))
            .await
            .map_err(|_| {
                Error::Agent(format!(
                    "analysis timed out after {}s",
                    self.options.unit_timeout.as_secs()
                ))
            })?
    }

    fn enqueue(&self, parent: Option<&ExplorationEntry>, follow_ups: &[FollowUp]) -> Result<()> {
        if follow_ups.is_empty() {
            return Ok(());
        }
        let max_depth = self.options.max_depth;
        let queued = self.handle.update(|s| {
            Ok(follow_ups
                .iter()
                .take(MAX_FOLLOW_UPS_PER_PASS)
                .filter(|f| {
                    s.exploration.push_follow_up(
                        parent,
                        &f.target,
                        &f.reason,
                        f.priority.max(1),
                        &self.id,
                        max_depth,
                    )
                })
                .count())
        })?;
        debug!(reviewer = %self.id, offered = follow_ups.len(), queued, "follow-ups queued");
        Ok(())
    }

    /// Content at the target ref, from the snapshot when possible.
    async fn file_content(&self, path: &str, cache: &mut HashMap<String, Option<String>>) -> Option<String> {
        if let Some(content) = self.snapshot.file(path) {
            return Some(content.to_string());
        }
        if let Some(cached) = cache.get(path) {
            return cached.clone();
        }
        let target = self.snapshot.target.clone();
        let owned = path.to_string();
        let content = match git::blocking(&self.git, move |g| g.show_file(&target, &owned)).await {
            Ok(content) => content,
            Err(e) => {
                debug!(path, error = %e, "could not read file at target");
                None
            }
        };
        cache.insert(path.to_string(), content.clone());
        content
    }

    async fn to_findings(
        &self,
        reported: Vec<ReportedFinding>,
        cache: &mut HashMap<String, Option<String>>,
    ) -> Vec<Finding> {
        let mut seen = HashSet::new();
        let mut findings = Vec::new();
        for r in reported {
            let file = r.file.trim().trim_start_matches("./").to_string();
            if file.is_empty() || r.title.trim().is_empty() {
                warn!(reviewer = %self.id, "dropping finding without file or title");
                continue;
            }
            let line = r.line.max(1);
            if !seen.insert((file.clone(), line, r.title.clone())) {
                continue;
            }
            let emission = findings.len() as u32;
            let anchor = self
                .file_content(&file, cache)
                .await
                .and_then(|content| Anchor::capture(&content, line));
            findings.push(Finding {
                id: Finding::finding_id(&self.id, emission),
                reviewer: self.id.clone(),
                emission,
                file,
                line,
                line_end: r.line_end.filter(|end| *end >= line),
                title: r.title.trim().to_string(),
                description: r.description,
                scenario: r.scenario,
                fix_plan: r.fix_plan,
                fix_summary: r.fix_summary,
                report_only: self.def.report_only,
                anchor,
                sequence: None,
                fix: FixRecord::default(),
            });
        }
        findings
    }
}
