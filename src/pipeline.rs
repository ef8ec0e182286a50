use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::AgentClient;
use crate::applier::{FindingOutcome, apply_next, publish_pending, session_trailer};
use crate::context::ChangeSnapshot;
use crate::coordinator::{AnalysisCoordinator, CoordinatorOptions};
use crate::error::{Error, Result};
use crate::git::{self, GitOperations, validate_branch_name};
use crate::publish::{
    PUBLISH_BACKOFF_BASE, PublishSink, Publisher, render_summary, tracking_title, with_retry,
};
use crate::registry::ReviewerRegistry;
use crate::report::write_report;
use crate::session::{
    ApplyMode, FileStatus, Phase, ReviewSession, ReviewerStatus, TrackingRef, now_secs,
};
use crate::sequencer::sequence;
use crate::store::{MetadataStore, SessionHandle, Transition};

/// Priority of exploration seeds taken from the changed-file list.
const SEED_PRIORITY: u32 = 1;

/// Observer for user-facing pipeline progress.
pub trait ProgressReporter: Send + Sync {
    fn phase_started(&self, phase: Phase);
    fn reviewers_started(&self, names: &[String]);
    fn finding_processed(&self, outcome: &FindingOutcome, total: usize);
    fn tracking_url(&self, url: &str);
    fn report(&self, body: &str);
}

/// Default reporter that prints to stderr.
pub struct StderrReporter;

impl ProgressReporter for StderrReporter {
    fn phase_started(&self, phase: Phase) {
        eprintln!("[revfix] Phase: {phase}");
    }

    fn reviewers_started(&self, names: &[String]) {
        eprintln!("[revfix] Running {} reviewers: {}", names.len(), names.join(", "));
    }

    fn finding_processed(&self, outcome: &FindingOutcome, total: usize) {
        match outcome.error {
            Some(ref error) => eprintln!(
                "[revfix] ({}/{total}) {}: {} ({error})",
                outcome.sequence, outcome.finding_id, outcome.state
            ),
            None => eprintln!(
                "[revfix] ({}/{total}) {}: {}",
                outcome.sequence, outcome.finding_id, outcome.state
            ),
        }
    }

    fn tracking_url(&self, url: &str) {
        eprintln!("[revfix] PR: {url}");
    }

    fn report(&self, body: &str) {
        eprintln!("[revfix] Report:\n{body}");
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub analysis: CoordinatorOptions,
    pub fix_branch_prefix: String,
    pub publish_retries: u32,
    pub publish_backoff: Duration,
}

impl PipelineOptions {
    pub fn new(analysis: CoordinatorOptions, fix_branch_prefix: &str, publish_retries: u32) -> Self {
        Self {
            analysis,
            fix_branch_prefix: fix_branch_prefix.to_string(),
            publish_retries,
            publish_backoff: PUBLISH_BACKOFF_BASE,
        }
    }
}

/// Parameters of a new session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub target: String,
    pub base: String,
    pub mode: ApplyMode,
    pub publish: bool,
    pub debug: bool,
}

/// Create a session in `Init` with one pending status per enabled reviewer,
/// in registration order.
pub fn start_session(
    store: &MetadataStore,
    registry: &ReviewerRegistry,
    request: &SessionRequest,
) -> Result<SessionHandle> {
    validate_branch_name(&request.target)?;
    validate_branch_name(&request.base)?;
    let id = ReviewSession::make_id(&request.target, now_secs());
    let mut session = ReviewSession::new(&id, &request.target, &request.base, request.mode);
    session.publish = request.publish;
    session.debug = request.debug;
    session.reviewers = registry
        .enabled()
        .into_iter()
        .map(|def| ReviewerStatus::pending(def.id.clone()))
        .collect();
    store.create(session)
}

/// Phase controller. Each step is idempotent and ends in a guarded
/// transition, so running it again on any persisted session only does the
/// work that is still missing.
pub struct Pipeline<A, G, P, R = StderrReporter> {
    agent: Arc<A>,
    git: Arc<G>,
    publisher: Arc<P>,
    registry: ReviewerRegistry,
    options: PipelineOptions,
    reporter: R,
}

impl<A, G, P> Pipeline<A, G, P>
where
    A: AgentClient + 'static,
    G: GitOperations + 'static,
    P: Publisher + 'static,
{
    pub fn new(
        agent: Arc<A>,
        git: Arc<G>,
        publisher: Arc<P>,
        registry: ReviewerRegistry,
        options: PipelineOptions,
    ) -> Self {
        Self::with_reporter(agent, git, publisher, registry, options, StderrReporter)
    }
}

impl<A, G, P, R> Pipeline<A, G, P, R>
where
    A: AgentClient + 'static,
    G: GitOperations + 'static,
    P: Publisher + 'static,
    R: ProgressReporter,
{
    pub fn with_reporter(
        agent: Arc<A>,
        git: Arc<G>,
        publisher: Arc<P>,
        registry: ReviewerRegistry,
        options: PipelineOptions,
        reporter: R,
    ) -> Self {
        Self {
            agent,
            git,
            publisher,
            registry,
            options,
            reporter,
        }
    }

    /// Drive the session to a terminal phase. Returns that phase; a session
    /// that failed is `Ok(Phase::Failed)` with its fault recorded.
    ///
    /// Cancellation is honored at transition boundaries and yields
    /// [`Error::Interrupted`] with the session left resumable.
    pub async fn run(&self, handle: &SessionHandle, shutdown: Option<watch::Receiver<bool>>) -> Result<Phase> {
        loop {
            let phase = handle.phase()?;
            if phase.is_terminal() {
                break;
            }
            if cancelled(shutdown.as_ref()) {
                info!(session = handle.id(), phase = %phase, "cancelled");
                return Err(Error::Interrupted);
            }

            self.reporter.phase_started(phase);
            match self.step(handle, phase, shutdown.as_ref()).await {
                Ok(()) => {}
                Err(Error::Interrupted) => {
                    info!(session = handle.id(), phase = %phase, "cancelled");
                    return Err(Error::Interrupted);
                }
                Err(e @ Error::Store(_)) => return Err(e),
                Err(e) => handle.fail(&e.to_string())?,
            }
        }

        let report = write_report(handle)?;
        self.reporter.report(&report);
        handle.phase()
    }

    async fn step(&self, handle: &SessionHandle, phase: Phase, shutdown: Option<&watch::Receiver<bool>>) -> Result<()> {
        match phase {
            Phase::Init => self.init(handle)?,
            Phase::Exploring => self.explore(handle).await?,
            Phase::Analyzing => self.analyze(handle, shutdown).await?,
            Phase::Sequencing => {
                let count = sequence(handle)?;
                info!(findings = count, "findings sequenced");
            }
            Phase::DraftCreated => self.create_draft(handle).await?,
            Phase::Fixing => self.fix(handle, shutdown).await?,
            Phase::Finalizing => self.finalize(handle).await?,
            Phase::Done | Phase::Failed => return Ok(()),
        }
        self.advance(handle, phase, shutdown)
    }

    fn advance(&self, handle: &SessionHandle, from: Phase, shutdown: Option<&watch::Receiver<bool>>) -> Result<()> {
        if cancelled(shutdown) {
            return Err(Error::Interrupted);
        }
        let Some(to) = from.successor() else {
            return Ok(());
        };
        if let Transition::Rejected { current } = handle.transition(from, to)? {
            debug!(expected = %from, current = %current, "phase already advanced");
        }
        Ok(())
    }

    fn init(&self, handle: &SessionHandle) -> Result<()> {
        let registry = &self.registry;
        handle.update(|s| {
            if s.reviewers.is_empty() {
                s.reviewers = registry
                    .enabled()
                    .into_iter()
                    .map(|def| ReviewerStatus::pending(def.id.clone()))
                    .collect();
            }
            Ok(())
        })
    }

    async fn explore(&self, handle: &SessionHandle) -> Result<()> {
        let session = handle.snapshot()?;
        let (base, target) = (session.base.clone(), session.target.clone());
        let changed = git::blocking(&self.git, move |g| g.changed_files(&base, &target)).await?;
        if changed.is_empty() {
            warn!(target = %session.target, base = %session.base, "no changed files");
        }
        let max_depth = self.options.analysis.max_depth;
        let seeded = handle.update(|s| {
            s.changed_files = changed;
            let mut seeded = 0;
            for file in s.changed_files.iter().filter(|f| f.status != FileStatus::Deleted) {
                if s.exploration
                    .push(&file.path, "changed in target", SEED_PRIORITY, 0, None, max_depth)
                {
                    seeded += 1;
                }
            }
            Ok(seeded)
        })?;
        info!(files = handle.snapshot()?.changed_files.len(), seeded, "change inventory recorded");
        Ok(())
    }

    async fn analyze(&self, handle: &SessionHandle, shutdown: Option<&watch::Receiver<bool>>) -> Result<()> {
        let session = handle.snapshot()?;
        // Reviewers read the working tree, so it must show the target.
        let target = session.target.clone();
        git::blocking(&self.git, move |g| g.checkout(&target)).await?;
        let frozen = session.clone();
        let snapshot = Arc::new(git::blocking(&self.git, move |g| ChangeSnapshot::capture(g, &frozen)).await?);

        let names: Vec<String> = session
            .reviewers
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.reviewer.to_string())
            .collect();
        if !names.is_empty() {
            self.reporter.reviewers_started(&names);
        }

        let coordinator = AnalysisCoordinator::new(
            Arc::clone(&self.agent),
            Arc::clone(&self.git),
            self.options.analysis.clone(),
        );
        let summary = coordinator.run(handle, &self.registry, snapshot, shutdown).await?;

        if handle.snapshot()?.reviewers.iter().any(|r| !r.state.is_terminal()) {
            // Only cancellation leaves reviewers unstarted.
            return Err(Error::Interrupted);
        }
        if summary.succeeded == 0 && summary.failed > 0 {
            warn!(failed = summary.failed, "every reviewer failed, continuing without findings");
        }
        Ok(())
    }

    fn fix_branch(&self, session: &ReviewSession) -> String {
        format!("{}/{}", self.options.fix_branch_prefix.trim_end_matches('/'), session.id)
    }

    async fn create_draft(&self, handle: &SessionHandle) -> Result<()> {
        let session = handle.snapshot()?;
        if session.findings.is_empty() {
            info!("no findings, skipping fix branch and tracking request");
            return Ok(());
        }
        if session.mode == ApplyMode::Report {
            info!("report mode, skipping fix branch and tracking request");
            return Ok(());
        }

        let branch = match session.fix_branch {
            Some(ref branch) => branch.clone(),
            None => {
                let branch = self.fix_branch(&session);
                validate_branch_name(&branch)?;
                handle.update(|s| {
                    s.fix_branch = Some(branch.clone());
                    Ok(())
                })?;
                branch
            }
        };
        let (name, target) = (branch.clone(), session.target.clone());
        git::blocking(&self.git, move |g| g.prepare_branch(&name, &target)).await?;

        let marker = format!("[review] start session {}", session.id);
        let trailer = session_trailer(&session.id);
        git::blocking(&self.git, move |g| {
            if g.find_commit(&[&marker])?.is_none() {
                let commit = g.commit_empty(&format!("{marker}\n\n{trailer}"))?;
                debug!(commit = %commit, "fix branch marker committed");
            }
            Ok(())
        })
        .await?;

        if session.publish && session.tracking.is_none() {
            self.ensure_tracking(handle, &branch).await?;
        }
        Ok(())
    }

    /// Push the fix branch and open the tracking request. A failure only
    /// leaves a warning; outcomes are then acknowledged locally.
    async fn ensure_tracking(&self, handle: &SessionHandle, branch: &str) -> Result<()> {
        let session = handle.snapshot()?;
        match self.open_tracking(&session, branch).await {
            Ok(tracking) => {
                self.reporter.tracking_url(&tracking.url);
                handle.update(|s| {
                    s.tracking = Some(tracking);
                    Ok(())
                })
            }
            Err(e) => {
                warn!(branch, error = %e, "continuing without a tracking request");
                handle.warn(format!("no tracking request: {e}"))
            }
        }
    }

    async fn open_tracking(&self, session: &ReviewSession, branch: &str) -> Result<TrackingRef> {
        let name = branch.to_string();
        git::blocking(&self.git, move |g| g.push(&name)).await?;

        let publisher = Arc::clone(&self.publisher);
        let (branch, target) = (branch.to_string(), session.target.clone());
        let title = tracking_title(session);
        let body = render_summary(session);
        with_retry(
            self.options.publish_retries,
            self.options.publish_backoff,
            "creating tracking request",
            move || publisher.create_tracking(&branch, &target, &title, &body),
        )
        .await
    }

    async fn fix(&self, handle: &SessionHandle, shutdown: Option<&watch::Receiver<bool>>) -> Result<()> {
        let session = handle.snapshot()?;
        let total = session.sequenced_findings().len();
        if let Some(branch) = session.fix_branch.clone() {
            let target = session.target.clone();
            git::blocking(&self.git, move |g| g.prepare_branch(&branch, &target)).await?;
        }

        let sink = PublishSink::new(Arc::clone(&self.publisher), self.options.publish_retries)
            .with_backoff(self.options.publish_backoff);
        publish_pending(handle, &sink).await?;

        loop {
            if cancelled(shutdown) {
                return Err(Error::Interrupted);
            }
            match apply_next(handle, &*self.agent, &self.git, &sink).await? {
                Some(outcome) => self.reporter.finding_processed(&outcome, total),
                None => break,
            }
        }
        Ok(())
    }

    async fn finalize(&self, handle: &SessionHandle) -> Result<()> {
        let session = handle.snapshot()?;
        if session.publish
            && session.tracking.is_none()
            && let Some(ref branch) = session.fix_branch
        {
            info!(branch = %branch, "retrying tracking request");
            self.ensure_tracking(handle, branch).await?;
        }

        let sink = PublishSink::new(Arc::clone(&self.publisher), self.options.publish_retries)
            .with_backoff(self.options.publish_backoff);
        let unpublished = publish_pending(handle, &sink).await?;
        if unpublished > 0 {
            warn!(unpublished, "some finding outcomes were never published");
        }

        let session = handle.snapshot()?;
        let Some(tracking) = session.tracking.clone() else {
            return Ok(());
        };
        let retries = self.options.publish_retries;
        let backoff = self.options.publish_backoff;

        let publisher = Arc::clone(&self.publisher);
        let target = tracking.clone();
        let body = render_summary(&session);
        if let Err(e) = with_retry(retries, backoff, "updating summary", move || {
            publisher.update_summary(&target, &body)
        })
        .await
        {
            handle.warn(e.to_string())?;
        }

        if let Some(branch) = session.fix_branch.clone() {
            let name = branch.clone();
            if let Err(e) = git::blocking(&self.git, move |g| g.push(&name)).await {
                handle.warn(format!("could not push {branch}: {e}"))?;
                return Ok(());
            }
        }

        let publisher = Arc::clone(&self.publisher);
        if let Err(e) = with_retry(retries, backoff, "marking request ready", move || {
            publisher.mark_ready(&tracking)
        })
        .await
        {
            handle.warn(e.to_string())?;
        }
        Ok(())
    }
}

fn cancelled(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}
