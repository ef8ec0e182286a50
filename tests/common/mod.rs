#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use revfix::agent::{AgentClient, FixReport, FixRequest};
use revfix::context::AnalysisContext;
use revfix::error::{Error, Result};
use revfix::git::GitOperations;
use revfix::publish::Publisher;
use revfix::registry::{ReviewerDefinition, ReviewerId, ReviewerRegistry};
use revfix::schema::{AnalysisOutput, FollowUp, ReportedFinding};
use revfix::session::{ChangedFile, FileStatus, TrackingRef};

pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} in {} failed: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn init_repo(dir: &Path) {
    run_git(dir, &["init"]);
    run_git(dir, &["config", "user.email", "test@test.com"]);
    run_git(dir, &["config", "user.name", "Test"]);
    run_git(dir, &["config", "commit.gpgsign", "false"]);
}

fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let full = dir.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }
}

/// Repo with `base_files` committed on `main` and `feature_files` committed
/// on top of it on `feature`, which is left checked out.
pub fn setup_feature_repo(base_files: &[(&str, &str)], feature_files: &[(&str, &str)]) -> tempfile::TempDir {
    let repo = tempfile::TempDir::new().unwrap();
    init_repo(repo.path());
    write_files(repo.path(), base_files);
    run_git(repo.path(), &["add", "-A"]);
    run_git(repo.path(), &["commit", "--allow-empty", "-m", "init"]);
    run_git(repo.path(), &["branch", "-M", "main"]);
    run_git(repo.path(), &["checkout", "-b", "feature"]);
    write_files(repo.path(), feature_files);
    run_git(repo.path(), &["add", "-A"]);
    run_git(repo.path(), &["commit", "-m", "feature work"]);
    repo
}

/// Like [`setup_feature_repo`] plus a bare `origin` holding both branches.
pub fn setup_feature_repo_with_remote(
    base_files: &[(&str, &str)],
    feature_files: &[(&str, &str)],
) -> (tempfile::TempDir, tempfile::TempDir) {
    let bare = tempfile::TempDir::new().unwrap();
    run_git(bare.path(), &["init", "--bare"]);
    let repo = setup_feature_repo(base_files, feature_files);
    run_git(
        repo.path(),
        &["remote", "add", "origin", bare.path().to_str().unwrap()],
    );
    run_git(repo.path(), &["push", "origin", "main", "feature"]);
    (bare, repo)
}

/// Subjects of commits on HEAD, newest first.
pub fn log_subjects(dir: &Path) -> Vec<String> {
    run_git(dir, &["log", "--format=%s"])
        .lines()
        .map(String::from)
        .collect()
}

/// `count` numbered lines: `let v1 = 1;` ...
pub fn numbered_lines(count: u32) -> String {
    (1..=count).map(|i| format!("let v{i} = {i};\n")).collect()
}

pub fn definition(id: &str) -> ReviewerDefinition {
    ReviewerDefinition {
        id: ReviewerId::parse(id).unwrap(),
        title: format!("{id} reviewer"),
        prompt: format!("Review for {id} issues."),
        tools: vec!["Read".to_string(), "Grep".to_string()],
        report_only: false,
        enabled: true,
        explore: false,
        source: PathBuf::from(format!("reviewers/{id}.md")),
    }
}

pub fn registry(ids: &[&str]) -> ReviewerRegistry {
    ReviewerRegistry::from_definitions(ids.iter().map(|id| definition(id)).collect()).unwrap()
}

pub fn reported(file: &str, line: u32, title: &str) -> ReportedFinding {
    ReportedFinding {
        file: file.to_string(),
        line,
        line_end: None,
        title: title.to_string(),
        description: format!("{title} description"),
        scenario: None,
        fix_plan: Some(format!("fix {title}")),
        fix_summary: None,
    }
}

pub fn follow_up(target: &str, priority: u32) -> FollowUp {
    FollowUp {
        target: target.to_string(),
        reason: format!("look at {target}"),
        priority,
    }
}

pub fn output(findings: Vec<ReportedFinding>) -> AnalysisOutput {
    AnalysisOutput {
        findings,
        ..Default::default()
    }
}

type FixFn = Box<dyn Fn(&FixRequest) -> Result<FixReport> + Send + Sync>;

/// Scripted agent. Analysis passes are popped per reviewer; a reviewer with
/// nothing scripted reports no findings.
pub struct MockAgent {
    passes: Mutex<HashMap<String, Vec<AnalysisOutput>>>,
    failing: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    fix: FixFn,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// (reviewer, focus target) per analysis call.
    pub analyze_calls: Mutex<Vec<(String, Option<String>)>>,
    pub fix_calls: Mutex<Vec<FixRequest>>,
    /// File content as the fix agent saw it, per call.
    pub fix_inputs: Mutex<Vec<String>>,
    analysis_cost: Option<f64>,
    checkout_dir: Option<PathBuf>,
    /// (checked-out branch, working tree matches the snapshot) per analysis call.
    pub checkouts: Mutex<Vec<(String, bool)>>,
}

impl Default for MockAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgent {
    pub fn new() -> Self {
        Self {
            passes: Mutex::new(HashMap::new()),
            failing: HashMap::new(),
            delays: HashMap::new(),
            fix: Box::new(|_| Err(Error::Agent("no fix behavior scripted".to_string()))),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            analyze_calls: Mutex::new(Vec::new()),
            fix_calls: Mutex::new(Vec::new()),
            fix_inputs: Mutex::new(Vec::new()),
            analysis_cost: None,
            checkout_dir: None,
            checkouts: Mutex::new(Vec::new()),
        }
    }

    /// Report `cost` for every analysis pass.
    pub fn with_analysis_cost(mut self, cost: f64) -> Self {
        self.analysis_cost = Some(cost);
        self
    }

    /// Record what is checked out in `dir` whenever analysis runs.
    pub fn recording_checkout(mut self, dir: &Path) -> Self {
        self.checkout_dir = Some(dir.to_path_buf());
        self
    }

    pub fn with_findings(self, reviewer: &str, findings: Vec<ReportedFinding>) -> Self {
        self.with_passes(reviewer, vec![output(findings)])
    }

    /// Responses for successive passes of one reviewer.
    pub fn with_passes(self, reviewer: &str, passes: Vec<AnalysisOutput>) -> Self {
        self.passes
            .lock()
            .unwrap()
            .insert(reviewer.to_string(), passes.into_iter().rev().collect());
        self
    }

    pub fn failing(mut self, reviewer: &str, error: &str) -> Self {
        self.failing.insert(reviewer.to_string(), error.to_string());
        self
    }

    pub fn with_delay(mut self, reviewer: &str, delay: Duration) -> Self {
        self.delays.insert(reviewer.to_string(), delay);
        self
    }

    pub fn with_fix(mut self, fix: impl Fn(&FixRequest) -> Result<FixReport> + Send + Sync + 'static) -> Self {
        self.fix = Box::new(fix);
        self
    }

    pub fn fixed_sequences(&self) -> Vec<u32> {
        self.fix_calls.lock().unwrap().iter().map(|r| r.sequence).collect()
    }

    pub fn analyzed_reviewers(&self) -> Vec<String> {
        self.analyze_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }
}

impl AgentClient for MockAgent {
    async fn analyze(&self, reviewer: &ReviewerDefinition, context: &AnalysisContext) -> Result<AnalysisOutput> {
        let id = reviewer.id.to_string();
        if let Some(dir) = &self.checkout_dir {
            let branch = run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).trim().to_string();
            let matches = context
                .snapshot
                .files
                .iter()
                .all(|(path, content)| std::fs::read_to_string(dir.join(path)).ok().as_ref() == Some(content));
            self.checkouts.lock().unwrap().push((branch, matches));
        }
        self.analyze_calls
            .lock()
            .unwrap()
            .push((id.clone(), context.focus.as_ref().map(|f| f.entry.target.clone())));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&id) {
            tokio::time::sleep(*delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.failing.get(&id) {
            return Err(Error::Agent(error.clone()));
        }
        let next = self.passes.lock().unwrap().get_mut(&id).and_then(Vec::pop);
        let mut out = next.unwrap_or_else(|| output(vec![]));
        if out.cost_usd.is_none() {
            out.cost_usd = self.analysis_cost;
        }
        Ok(out)
    }

    async fn apply_fix(&self, request: &FixRequest) -> Result<FixReport> {
        let current = std::fs::read_to_string(request.workdir.join(&request.finding.file)).unwrap_or_default();
        self.fix_inputs.lock().unwrap().push(current);
        self.fix_calls.lock().unwrap().push(request.clone());
        (self.fix)(request)
    }
}

/// Replace the resolved line of the finding's file with `// fixed <title>`.
pub fn replace_resolved_line(request: &FixRequest) -> Result<FixReport> {
    let path = request.workdir.join(&request.finding.file);
    let content = std::fs::read_to_string(&path)?;
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let idx = request.location.line as usize - 1;
    lines[idx] = format!("// fixed {}", request.finding.title);
    std::fs::write(&path, lines.join("\n") + "\n")?;
    Ok(FixReport {
        file: Some(request.finding.file.clone()),
        line: Some(request.location.line),
        summary: Some(format!("fixed {}", request.finding.title)),
        cost_usd: None,
    })
}

/// Insert `count` comment lines above the resolved line.
pub fn insert_above_resolved_line(request: &FixRequest, count: usize) -> Result<FixReport> {
    let path = request.workdir.join(&request.finding.file);
    let content = std::fs::read_to_string(&path)?;
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let idx = request.location.line as usize - 1;
    for i in 0..count {
        lines.insert(idx, format!("// guard {i}"));
    }
    std::fs::write(&path, lines.join("\n") + "\n")?;
    Ok(FixReport {
        file: Some(request.finding.file.clone()),
        line: Some(request.location.line + count as u32),
        summary: None,
        cost_usd: None,
    })
}

/// In-memory git for analysis tests. Nothing is ever committed.
pub struct MockGit {
    workdir: PathBuf,
    pub diff: String,
    pub changed: Vec<ChangedFile>,
    /// Content at the target ref.
    pub files: BTreeMap<String, String>,
    pub show_calls: Mutex<Vec<String>>,
}

impl MockGit {
    pub fn new(files: &[(&str, &str)]) -> Self {
        Self {
            workdir: PathBuf::from("/nonexistent"),
            diff: "diff --git a/x b/x".to_string(),
            changed: files
                .iter()
                .map(|(path, _)| ChangedFile {
                    path: path.to_string(),
                    status: FileStatus::Modified,
                    additions: 1,
                    deletions: 0,
                })
                .collect(),
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            show_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_unchanged_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }
}

impl GitOperations for MockGit {
    fn workdir(&self) -> &Path {
        &self.workdir
    }
    fn diff(&self, _: &str, _: &str) -> Result<String> {
        Ok(self.diff.clone())
    }
    fn changed_files(&self, _: &str, _: &str) -> Result<Vec<ChangedFile>> {
        Ok(self.changed.clone())
    }
    fn show_file(&self, _: &str, path: &str) -> Result<Option<String>> {
        self.show_calls.lock().unwrap().push(path.to_string());
        Ok(self.files.get(path).cloned())
    }
    fn checkout(&self, _: &str) -> Result<()> {
        Ok(())
    }
    fn prepare_branch(&self, _: &str, _: &str) -> Result<bool> {
        Ok(true)
    }
    fn commit_all(&self, _: &str) -> Result<Option<String>> {
        Ok(None)
    }
    fn commit_empty(&self, _: &str) -> Result<String> {
        Ok("0000000".to_string())
    }
    fn find_commit(&self, _: &[&str]) -> Result<Option<String>> {
        Ok(None)
    }
    fn discard_changes(&self) -> Result<()> {
        Ok(())
    }
    fn push(&self, _: &str) -> Result<()> {
        Ok(())
    }
}

/// Records publication calls; dedupes comments by marker like the real
/// backend. The first `outcome_failures` outcome posts and the first
/// `tracking_failures` tracking requests fail.
#[derive(Default)]
pub struct MockPublisher {
    pub outcome_failures: AtomicU32,
    pub tracking_failures: AtomicU32,
    pub created: AtomicU32,
    pub comments: Mutex<Vec<(String, String)>>,
    pub summaries: Mutex<Vec<String>>,
    pub ready: AtomicU32,
    markers: Mutex<HashSet<String>>,
}

impl MockPublisher {
    pub fn failing_outcomes(count: u32) -> Self {
        let publisher = Self::default();
        publisher.outcome_failures.store(count, Ordering::SeqCst);
        publisher
    }

    pub fn failing_tracking(count: u32) -> Self {
        let publisher = Self::default();
        publisher.tracking_failures.store(count, Ordering::SeqCst);
        publisher
    }

    pub fn comment_markers(&self) -> Vec<String> {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }
}

impl Publisher for MockPublisher {
    fn create_tracking(&self, branch: &str, _: &str, _: &str, _: &str) -> Result<TrackingRef> {
        if self
            .tracking_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Publish("gh: HTTP 502".to_string()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TrackingRef {
            number: 100 + n as u64,
            url: format!("https://example.test/pull/{branch}"),
        })
    }

    fn publish_outcome(&self, _: &TrackingRef, marker: &str, body: &str) -> Result<()> {
        if self
            .outcome_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Publish("hosting unavailable".to_string()));
        }
        if self.markers.lock().unwrap().insert(marker.to_string()) {
            self.comments
                .lock()
                .unwrap()
                .push((marker.to_string(), body.to_string()));
        }
        Ok(())
    }

    fn update_summary(&self, _: &TrackingRef, body: &str) -> Result<()> {
        self.summaries.lock().unwrap().push(body.to_string());
        Ok(())
    }

    fn mark_ready(&self, _: &TrackingRef) -> Result<()> {
        self.ready.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
