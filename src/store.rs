use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::ReviewerId;
use crate::session::{Fault, Finding, Phase, ReviewSession, ReviewerState, now_secs};

const SESSION_FILE: &str = "session.toml";
const CURRENT_FILE: &str = "current";

/// Outcome of a guarded phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Committed,
    /// The recorded phase did not match the expected one; nothing changed.
    Rejected { current: Phase },
}

/// Durable session records persisted as TOML under `<state_dir>/<id>/`.
pub struct MetadataStore {
    state_dir: PathBuf,
}

impl MetadataStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Default state directory relative to a repo root.
    pub fn default_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(".revfix").join("sessions")
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.state_dir.join(id)
    }

    /// Persist a new session and mark it as the latest one.
    pub fn create(&self, session: ReviewSession) -> Result<SessionHandle> {
        let dir = self.session_dir(&session.id);
        if dir.join(SESSION_FILE).exists() {
            return Err(Error::Store(format!("session already exists: {}", session.id)));
        }
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Store(format!("failed to create session dir: {e}")))?;
        // Keep session records out of fix commits.
        let ignore = self.state_dir.join(".gitignore");
        if !ignore.exists() {
            std::fs::write(&ignore, "*\n")?;
        }

        let handle = SessionHandle::new(session, dir);
        handle.persist(&*handle.lock()?)?;
        write_atomic(&self.state_dir.join(CURRENT_FILE), handle.id().as_bytes())?;
        info!(session = handle.id(), "session created");
        Ok(handle)
    }

    /// Load a session. Corrupt records are an error, never silently reset.
    pub fn load(&self, id: &str) -> Result<SessionHandle> {
        let dir = self.session_dir(id);
        let path = dir.join(SESSION_FILE);
        if !path.exists() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Store(format!("failed to read {}: {e}", path.display())))?;
        let session: ReviewSession = toml::from_str(&content)
            .map_err(|e| Error::Store(format!("corrupted session file {}: {e}", path.display())))?;
        if session.id != id {
            return Err(Error::Store(format!(
                "session file {} records id '{}'",
                path.display(),
                session.id
            )));
        }
        debug!(session = id, phase = %session.phase, "session loaded");
        Ok(SessionHandle::new(session, dir))
    }

    /// Id of the most recently created session, if any.
    pub fn latest_id(&self) -> Result<Option<String>> {
        let path = self.state_dir.join(CURRENT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let id = std::fs::read_to_string(&path)?.trim().to_string();
        Ok((!id.is_empty()).then_some(id))
    }

    /// Load `id`, or the latest session when `None`.
    pub fn load_or_latest(&self, id: Option<&str>) -> Result<SessionHandle> {
        match id {
            Some(id) => self.load(id),
            None => {
                let id = self
                    .latest_id()?
                    .ok_or_else(|| Error::SessionNotFound("no sessions recorded".to_string()))?;
                self.load(&id)
            }
        }
    }
}

/// Shared handle to one session. Every mutation is persisted before the
/// in-memory copy changes, so a failed write leaves both unchanged.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    dir: PathBuf,
    inner: Arc<Mutex<ReviewSession>>,
}

impl SessionHandle {
    fn new(session: ReviewSession, dir: PathBuf) -> Self {
        Self {
            id: session.id.clone(),
            dir,
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join("report.md")
    }

    pub fn debug_dir(&self) -> PathBuf {
        self.dir.join("debug")
    }

    fn lock(&self) -> Result<MutexGuard<'_, ReviewSession>> {
        self.inner
            .lock()
            .map_err(|_| Error::Store("session lock poisoned".to_string()))
    }

    fn persist(&self, session: &ReviewSession) -> Result<()> {
        let content = toml::to_string_pretty(session)
            .map_err(|e| Error::Store(format!("failed to serialize session: {e}")))?;
        write_atomic(&self.dir.join(SESSION_FILE), content.as_bytes())
    }

    pub fn snapshot(&self) -> Result<ReviewSession> {
        Ok(self.lock()?.clone())
    }

    pub fn phase(&self) -> Result<Phase> {
        Ok(self.lock()?.phase)
    }

    /// Apply `f` to a copy, persist it, then publish it in memory.
    pub fn update<T>(&self, f: impl FnOnce(&mut ReviewSession) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.updated_at = now_secs();
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    /// Move `from -> to` if `from` is still the recorded phase.
    pub fn transition(&self, from: Phase, to: Phase) -> Result<Transition> {
        let outcome = self.update(|s| {
            if s.phase != from {
                return Ok(Transition::Rejected { current: s.phase });
            }
            if !from.can_transition_to(to) {
                return Err(Error::IllegalTransition { from, to });
            }
            s.phase = to;
            Ok(Transition::Committed)
        })?;
        match outcome {
            Transition::Committed => info!(session = %self.id, from = %from, to = %to, "phase transition"),
            Transition::Rejected { current } => {
                debug!(session = %self.id, from = %from, to = %to, current = %current, "transition rejected")
            }
        }
        Ok(outcome)
    }

    /// Record a fault and move to `Failed` from whatever non-terminal phase
    /// the session is in.
    pub fn fail(&self, message: &str) -> Result<()> {
        self.update(|s| {
            if s.phase.is_terminal() {
                return Ok(());
            }
            s.fault = Some(Fault {
                phase: s.phase,
                message: message.to_string(),
                at: now_secs(),
            });
            s.phase = Phase::Failed;
            Ok(())
        })?;
        warn!(session = %self.id, error = message, "session failed");
        Ok(())
    }

    pub fn append_finding(&self, finding: Finding) -> Result<()> {
        self.append_findings(vec![finding])
    }

    /// Append findings; ids must be new.
    pub fn append_findings(&self, findings: Vec<Finding>) -> Result<()> {
        self.update(|s| {
            for finding in findings {
                if s.finding(&finding.id).is_some() {
                    return Err(Error::Store(format!("duplicate finding id: {}", finding.id)));
                }
                s.findings.push(finding);
            }
            Ok(())
        })
    }

    pub fn update_finding(&self, id: &str, f: impl FnOnce(&mut Finding)) -> Result<()> {
        self.update(|s| {
            let finding = s
                .finding_mut(id)
                .ok_or_else(|| Error::Store(format!("unknown finding: {id}")))?;
            f(finding);
            Ok(())
        })
    }

    pub fn set_reviewer_status(
        &self,
        reviewer: &ReviewerId,
        state: ReviewerState,
        error: Option<String>,
    ) -> Result<()> {
        self.update(|s| {
            let status = s
                .reviewer_mut(reviewer)
                .ok_or_else(|| Error::Store(format!("reviewer not in session: {reviewer}")))?;
            status.state = state;
            status.error = error;
            Ok(())
        })
    }

    pub fn warn(&self, message: String) -> Result<()> {
        warn!(session = %self.id, "{message}");
        self.update(|s| {
            s.warnings.push(message);
            Ok(())
        })
    }
}

/// Write via a synced temp file and rename, so readers never see a torn file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)
        .map_err(|e| Error::Store(format!("failed to create {}: {e}", tmp.display())))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|e| Error::Store(format!("failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::Store(format!("failed to commit {}: {e}", path.display())))?;
    Ok(())
}
