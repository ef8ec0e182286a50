mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use common::{
    MockAgent, MockPublisher, definition, log_subjects, numbered_lines, reported, replace_resolved_line,
    run_git, setup_feature_repo, setup_feature_repo_with_remote,
};
use revfix::applier::FindingOutcome;
use revfix::coordinator::CoordinatorOptions;
use revfix::error::Error;
use revfix::git::GitCli;
use revfix::pipeline::{Pipeline, PipelineOptions, ProgressReporter, SessionRequest, start_session};
use revfix::registry::ReviewerRegistry;
use revfix::session::{ApplyMode, FixState, Phase, ReviewerState};
use revfix::store::{MetadataStore, SessionHandle};

#[derive(Default)]
struct RecordingReporter {
    events: Arc<Mutex<Vec<String>>>,
    /// Flipped after this many processed findings.
    cancel_after: Option<(usize, watch::Sender<bool>)>,
}

impl ProgressReporter for RecordingReporter {
    fn phase_started(&self, phase: Phase) {
        self.events.lock().unwrap().push(format!("phase:{phase}"));
    }

    fn reviewers_started(&self, names: &[String]) {
        self.events.lock().unwrap().push(format!("reviewers:{}", names.len()));
    }

    fn finding_processed(&self, outcome: &FindingOutcome, _total: usize) {
        self.events
            .lock()
            .unwrap()
            .push(format!("finding:{}:{}", outcome.sequence, outcome.state));
        if let Some((after, ref tx)) = self.cancel_after
            && outcome.sequence as usize >= after
        {
            let _ = tx.send(true);
        }
    }

    fn tracking_url(&self, url: &str) {
        self.events.lock().unwrap().push(format!("url:{url}"));
    }

    fn report(&self, _body: &str) {
        self.events.lock().unwrap().push("report".to_string());
    }
}

fn options() -> PipelineOptions {
    let mut options = PipelineOptions::new(
        CoordinatorOptions {
            max_concurrency: 4,
            unit_timeout: Duration::from_secs(10),
            max_depth: 5,
            retry_failed: false,
        },
        "revfix",
        2,
    );
    options.publish_backoff = Duration::from_millis(1);
    options
}

fn new_session(state: &tempfile::TempDir, registry: &ReviewerRegistry, publish: bool) -> SessionHandle {
    new_session_in_mode(state, registry, publish, ApplyMode::Apply)
}

fn new_session_in_mode(
    state: &tempfile::TempDir,
    registry: &ReviewerRegistry,
    publish: bool,
    mode: ApplyMode,
) -> SessionHandle {
    start_session(
        &MetadataStore::new(state.path().join("sessions")),
        registry,
        &SessionRequest {
            target: "feature".to_string(),
            base: "main".to_string(),
            mode,
            publish,
            debug: false,
        },
    )
    .unwrap()
}

fn pipeline(
    agent: &Arc<MockAgent>,
    repo: &std::path::Path,
    publisher: &Arc<MockPublisher>,
    registry: ReviewerRegistry,
    reporter: RecordingReporter,
) -> Pipeline<MockAgent, GitCli, MockPublisher, RecordingReporter> {
    Pipeline::with_reporter(
        Arc::clone(agent),
        Arc::new(GitCli::new(repo.to_path_buf())),
        Arc::clone(publisher),
        registry,
        options(),
        reporter,
    )
}

fn nine_reviewers() -> ReviewerRegistry {
    let mut defs: Vec<_> = (1..=9).map(|i| definition(&format!("r{i}"))).collect();
    defs[1].report_only = true;
    ReviewerRegistry::from_definitions(defs).unwrap()
}

fn six_finding_agent() -> MockAgent {
    MockAgent::new()
        .with_findings("r1", vec![reported("src/lib.rs", 2, "one"), reported("src/lib.rs", 4, "two")])
        .with_findings("r2", vec![reported("src/lib.rs", 6, "three")])
        .with_findings(
            "r3",
            vec![
                reported("src/lib.rs", 8, "four"),
                reported("src/lib.rs", 10, "five"),
                reported("src/lib.rs", 12, "six"),
            ],
        )
        .with_fix(replace_resolved_line)
}

#[tokio::test]
async fn test_full_run_with_report_only_reviewer() {
    let repo = setup_feature_repo(&[("README.md", "x\n")], &[("src/lib.rs", numbered_lines(20).as_str())]);
    let state = tempfile::tempdir().unwrap();
    let registry = nine_reviewers();
    let handle = new_session(&state, &registry, false);
    let agent = Arc::new(six_finding_agent());
    let publisher = Arc::new(MockPublisher::default());

    let phase = pipeline(&agent, repo.path(), &publisher, registry, RecordingReporter::default())
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Done);

    let session = handle.snapshot().unwrap();
    assert!(session.reviewers.iter().all(|r| r.state == ReviewerState::Succeeded));
    let outcomes: Vec<(u32, &str, FixState)> = session
        .sequenced_findings()
        .iter()
        .map(|f| (f.sequence.unwrap(), f.title.as_str(), f.fix.state))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            (1, "one", FixState::Applied),
            (2, "two", FixState::Applied),
            (3, "three", FixState::Skipped),
            (4, "four", FixState::Applied),
            (5, "five", FixState::Applied),
            (6, "six", FixState::Applied),
        ]
    );
    assert_eq!(agent.fixed_sequences(), vec![1, 2, 4, 5, 6]);

    // Local run: fix branch with commits, no tracking request.
    let branch = session.fix_branch.clone().unwrap();
    assert_eq!(branch, format!("revfix/{}", session.id));
    assert!(session.tracking.is_none());
    assert_eq!(publisher.created.load(Ordering::SeqCst), 0);
    let current = run_git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
    assert_eq!(current.trim(), branch);
    let subjects = log_subjects(repo.path());
    assert_eq!(subjects[0], "[review] (6) six");
    assert_eq!(subjects[5], format!("[review] start session {}", session.id));

    let report = std::fs::read_to_string(handle.report_path()).unwrap();
    assert!(report.contains("5 applied, 0 failed, 1 skipped, 0 pending"));
}

#[tokio::test]
async fn test_published_run_creates_one_request() {
    let (bare, repo) =
        setup_feature_repo_with_remote(&[("README.md", "x\n")], &[("src/lib.rs", numbered_lines(10).as_str())]);
    let state = tempfile::tempdir().unwrap();
    let registry = ReviewerRegistry::from_definitions(vec![definition("sec")]).unwrap();
    let handle = new_session(&state, &registry, true);
    let agent = Arc::new(
        MockAgent::new()
            .with_findings("sec", vec![reported("src/lib.rs", 3, "a"), reported("src/lib.rs", 7, "b")])
            .with_fix(replace_resolved_line),
    );
    let publisher = Arc::new(MockPublisher::default());

    let phase = pipeline(&agent, repo.path(), &publisher, registry.clone(), RecordingReporter::default())
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Done);

    let session = handle.snapshot().unwrap();
    assert_eq!(publisher.created.load(Ordering::SeqCst), 1);
    assert_eq!(session.tracking.as_ref().unwrap().number, 101);
    assert_eq!(publisher.comment_markers().len(), 2);
    assert_eq!(publisher.ready.load(Ordering::SeqCst), 1);
    let summary = publisher.summaries.lock().unwrap().last().cloned().unwrap();
    assert!(summary.contains("| 1 | sec | a | `src/lib.rs` | 3 | applied |"));
    assert!(summary.contains("| 2 | sec | b | `src/lib.rs` | 7 | applied |"));

    let branch = session.fix_branch.unwrap();
    let remote_log = run_git(bare.path(), &["log", "--format=%s", &branch]);
    assert!(remote_log.starts_with("[review] (2) b"));

    // Running again is a no-op: no second request, no new comments.
    let phase = pipeline(&agent, repo.path(), &publisher, registry, RecordingReporter::default())
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Done);
    assert_eq!(publisher.created.load(Ordering::SeqCst), 1);
    assert_eq!(publisher.comment_markers().len(), 2);
}

#[tokio::test]
async fn test_analysis_runs_with_target_checked_out() {
    let repo = setup_feature_repo(&[("src/lib.rs", "old\n")], &[("src/lib.rs", numbered_lines(6).as_str())]);
    // The user starts the review from another branch.
    run_git(repo.path(), &["checkout", "-q", "main"]);
    let state = tempfile::tempdir().unwrap();
    let registry = ReviewerRegistry::from_definitions(vec![definition("sec")]).unwrap();
    let handle = new_session(&state, &registry, false);
    let agent = Arc::new(
        MockAgent::new()
            .recording_checkout(repo.path())
            .with_findings("sec", vec![reported("src/lib.rs", 2, "a")])
            .with_fix(replace_resolved_line),
    );
    let publisher = Arc::new(MockPublisher::default());

    let phase = pipeline(&agent, repo.path(), &publisher, registry, RecordingReporter::default())
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Done);

    assert_eq!(*agent.checkouts.lock().unwrap(), vec![("feature".to_string(), true)]);
    let session = handle.snapshot().unwrap();
    assert_eq!(session.findings[0].fix.state, FixState::Applied);
    let content = std::fs::read_to_string(repo.path().join("src/lib.rs")).unwrap();
    assert_eq!(content.lines().nth(1), Some("// fixed a"));
}

#[tokio::test]
async fn test_tracking_failure_continues_without_request() {
    let (_bare, repo) =
        setup_feature_repo_with_remote(&[("README.md", "x\n")], &[("src/lib.rs", numbered_lines(10).as_str())]);
    let state = tempfile::tempdir().unwrap();
    let registry = ReviewerRegistry::from_definitions(vec![definition("sec")]).unwrap();
    let handle = new_session(&state, &registry, true);
    let agent = Arc::new(
        MockAgent::new()
            .with_findings("sec", vec![reported("src/lib.rs", 3, "a"), reported("src/lib.rs", 7, "b")])
            .with_fix(replace_resolved_line),
    );
    let publisher = Arc::new(MockPublisher::failing_tracking(u32::MAX));
    let reporter = RecordingReporter::default();
    let events = Arc::clone(&reporter.events);

    let phase = pipeline(&agent, repo.path(), &publisher, registry, reporter)
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Done);

    let session = handle.snapshot().unwrap();
    assert!(session.fault.is_none());
    assert!(session.tracking.is_none());
    assert!(
        session
            .findings
            .iter()
            .all(|f| f.fix.state == FixState::Applied && f.fix.published)
    );
    assert_eq!(publisher.created.load(Ordering::SeqCst), 0);
    assert!(publisher.comment_markers().is_empty());
    assert_eq!(publisher.ready.load(Ordering::SeqCst), 0);
    // Once when the draft was due, once more at finalization.
    assert_eq!(session.warnings.len(), 2);
    assert!(session.warnings.iter().all(|w| w.contains("creating tracking request")));
    assert!(!events.lock().unwrap().iter().any(|e| e.starts_with("url:")));

    let report = std::fs::read_to_string(handle.report_path()).unwrap();
    assert!(report.contains("2 applied, 0 failed, 0 skipped, 0 pending"));
    assert!(!report.contains("(not published)"));
}

#[tokio::test]
async fn test_tracking_request_retried_at_finalization() {
    let (_bare, repo) =
        setup_feature_repo_with_remote(&[("README.md", "x\n")], &[("src/lib.rs", numbered_lines(10).as_str())]);
    let state = tempfile::tempdir().unwrap();
    let registry = ReviewerRegistry::from_definitions(vec![definition("sec")]).unwrap();
    let handle = new_session(&state, &registry, true);
    let agent = Arc::new(
        MockAgent::new()
            .with_findings("sec", vec![reported("src/lib.rs", 3, "a"), reported("src/lib.rs", 7, "b")])
            .with_fix(replace_resolved_line),
    );
    // Both attempts during the draft phase fail; the hosting side is back later.
    let publisher = Arc::new(MockPublisher::failing_tracking(2));

    let phase = pipeline(&agent, repo.path(), &publisher, registry, RecordingReporter::default())
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Done);

    let session = handle.snapshot().unwrap();
    assert_eq!(session.tracking.as_ref().unwrap().number, 101);
    assert_eq!(publisher.created.load(Ordering::SeqCst), 1);
    assert_eq!(publisher.ready.load(Ordering::SeqCst), 1);
    assert_eq!(session.warnings.len(), 1);
    let summary = publisher.summaries.lock().unwrap().last().cloned().unwrap();
    assert!(summary.contains("| 1 | sec | a | `src/lib.rs` | 3 | applied |"));
    assert!(summary.contains("| 2 | sec | b | `src/lib.rs` | 7 | applied |"));
}

#[tokio::test]
async fn test_report_mode_leaves_repository_untouched() {
    let (_bare, repo) =
        setup_feature_repo_with_remote(&[("README.md", "x\n")], &[("src/lib.rs", numbered_lines(10).as_str())]);
    let state = tempfile::tempdir().unwrap();
    let registry = ReviewerRegistry::from_definitions(vec![definition("sec")]).unwrap();
    let handle = new_session_in_mode(&state, &registry, true, ApplyMode::Report);
    let agent = Arc::new(
        MockAgent::new()
            .with_findings("sec", vec![reported("src/lib.rs", 3, "a"), reported("src/lib.rs", 7, "b")])
            .with_fix(replace_resolved_line),
    );
    let publisher = Arc::new(MockPublisher::default());

    let phase = pipeline(&agent, repo.path(), &publisher, registry, RecordingReporter::default())
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Done);

    let session = handle.snapshot().unwrap();
    assert!(session.findings.iter().all(|f| f.fix.state == FixState::Skipped));
    assert!(agent.fix_calls.lock().unwrap().is_empty());
    assert!(session.fix_branch.is_none());
    assert!(session.tracking.is_none());
    assert_eq!(publisher.created.load(Ordering::SeqCst), 0);
    assert_eq!(publisher.ready.load(Ordering::SeqCst), 0);
    assert!(publisher.comment_markers().is_empty());
    let current = run_git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
    assert_eq!(current.trim(), "feature");
    assert_eq!(log_subjects(repo.path())[0], "feature work");
}

#[tokio::test]
async fn test_no_findings_means_no_branch_or_request() {
    let repo = setup_feature_repo(&[("README.md", "x\n")], &[("src/lib.rs", "fn ok() {}\n")]);
    let state = tempfile::tempdir().unwrap();
    let registry = ReviewerRegistry::from_definitions(vec![definition("sec")]).unwrap();
    let handle = new_session(&state, &registry, true);
    let agent = Arc::new(MockAgent::new());
    let publisher = Arc::new(MockPublisher::default());

    let phase = pipeline(&agent, repo.path(), &publisher, registry, RecordingReporter::default())
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Done);

    let session = handle.snapshot().unwrap();
    assert!(session.fix_branch.is_none());
    assert!(session.tracking.is_none());
    assert_eq!(publisher.created.load(Ordering::SeqCst), 0);
    let current = run_git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
    assert_eq!(current.trim(), "feature");
}

#[tokio::test]
async fn test_every_reviewer_failing_still_finishes() {
    let repo = setup_feature_repo(&[("README.md", "x\n")], &[("src/lib.rs", "fn ok() {}\n")]);
    let state = tempfile::tempdir().unwrap();
    let registry = ReviewerRegistry::from_definitions(vec![definition("a"), definition("b")]).unwrap();
    let handle = new_session(&state, &registry, false);
    let agent = Arc::new(MockAgent::new().failing("a", "boom").failing("b", "bang"));
    let publisher = Arc::new(MockPublisher::default());

    let phase = pipeline(&agent, repo.path(), &publisher, registry, RecordingReporter::default())
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Done);

    let report = std::fs::read_to_string(handle.report_path()).unwrap();
    assert!(report.contains("## Reviewers (0/2 succeeded)"));
    assert!(report.contains("- `a`: failed (agent error: boom)"));
    assert!(report.contains("No findings."));
}

#[tokio::test]
async fn test_git_failure_fails_session_with_fault() {
    let repo = setup_feature_repo(&[("README.md", "x\n")], &[("src/lib.rs", "fn ok() {}\n")]);
    let state = tempfile::tempdir().unwrap();
    let registry = ReviewerRegistry::from_definitions(vec![definition("sec")]).unwrap();
    let handle = start_session(
        &MetadataStore::new(state.path().join("sessions")),
        &registry,
        &SessionRequest {
            target: "feature".to_string(),
            base: "no-such-branch".to_string(),
            mode: ApplyMode::Apply,
            publish: false,
            debug: false,
        },
    )
    .unwrap();
    let agent = Arc::new(MockAgent::new());
    let publisher = Arc::new(MockPublisher::default());

    let phase = pipeline(&agent, repo.path(), &publisher, registry, RecordingReporter::default())
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Failed);

    let session = handle.snapshot().unwrap();
    let fault = session.fault.unwrap();
    assert_eq!(fault.phase, Phase::Exploring);
    assert!(fault.message.contains("git"));
    assert!(agent.analyze_calls.lock().unwrap().is_empty());
    assert!(handle.report_path().exists());
}

#[tokio::test]
async fn test_cancel_before_start_leaves_session_resumable() {
    let repo = setup_feature_repo(&[("README.md", "x\n")], &[("src/lib.rs", "fn ok() {}\n")]);
    let state = tempfile::tempdir().unwrap();
    let registry = ReviewerRegistry::from_definitions(vec![definition("sec")]).unwrap();
    let handle = new_session(&state, &registry, false);
    let agent = Arc::new(MockAgent::new());
    let publisher = Arc::new(MockPublisher::default());
    let (_tx, rx) = watch::channel(true);

    let err = pipeline(&agent, repo.path(), &publisher, registry, RecordingReporter::default())
        .run(&handle, Some(rx))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Interrupted));
    assert_eq!(handle.phase().unwrap(), Phase::Init);
}

#[tokio::test]
async fn test_cancel_mid_fix_then_resume_applies_the_rest() {
    let repo = setup_feature_repo(&[("README.md", "x\n")], &[("src/lib.rs", numbered_lines(20).as_str())]);
    let state = tempfile::tempdir().unwrap();
    let registry = nine_reviewers();
    let handle = new_session(&state, &registry, false);
    let agent = Arc::new(six_finding_agent());
    let publisher = Arc::new(MockPublisher::default());

    let (tx, rx) = watch::channel(false);
    let reporter = RecordingReporter {
        cancel_after: Some((2, tx)),
        ..Default::default()
    };
    let err = pipeline(&agent, repo.path(), &publisher, registry.clone(), reporter)
        .run(&handle, Some(rx))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Interrupted));

    // The in-flight finding completed before halting.
    let session = handle.snapshot().unwrap();
    assert_eq!(session.phase, Phase::Fixing);
    assert_eq!(session.fix_cursor, 2);
    assert_eq!(agent.fixed_sequences(), vec![1, 2]);

    // Resume with a fresh agent: analysis is not repeated, only 3..6 are processed.
    let resumed = Arc::new(MockAgent::new().with_fix(replace_resolved_line));
    let phase = pipeline(&resumed, repo.path(), &publisher, registry, RecordingReporter::default())
        .run(&handle, None)
        .await
        .unwrap();
    assert_eq!(phase, Phase::Done);
    assert!(resumed.analyze_calls.lock().unwrap().is_empty());
    assert_eq!(resumed.fixed_sequences(), vec![4, 5, 6]);

    let session = handle.snapshot().unwrap();
    assert_eq!(session.outcome_counts().applied, 5);
    assert_eq!(session.outcome_counts().skipped, 1);
    let subjects = log_subjects(repo.path());
    assert_eq!(subjects.iter().filter(|s| s.starts_with("[review] (")).count(), 5);
}

#[tokio::test]
async fn test_phases_reported_in_order() {
    let repo = setup_feature_repo(&[("README.md", "x\n")], &[("src/lib.rs", numbered_lines(5).as_str())]);
    let state = tempfile::tempdir().unwrap();
    let registry = ReviewerRegistry::from_definitions(vec![definition("sec")]).unwrap();
    let handle = new_session(&state, &registry, false);
    let agent = Arc::new(
        MockAgent::new()
            .with_findings("sec", vec![reported("src/lib.rs", 2, "a")])
            .with_fix(replace_resolved_line),
    );
    let publisher = Arc::new(MockPublisher::default());
    let reporter = RecordingReporter::default();
    let events = Arc::clone(&reporter.events);

    pipeline(&agent, repo.path(), &publisher, registry, reporter)
        .run(&handle, None)
        .await
        .unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "phase:init",
            "phase:exploring",
            "phase:analyzing",
            "reviewers:1",
            "phase:sequencing",
            "phase:draft_created",
            "phase:fixing",
            "finding:1:applied",
            "phase:finalizing",
            "report",
        ]
    );

    let session = handle.snapshot().unwrap();
    assert_eq!(session.changed_files.len(), 1);
    assert!(
        session
            .exploration
            .entries()
            .iter()
            .any(|e| e.target == "src/lib.rs" && e.depth == 0 && e.origin.is_none())
    );
}
