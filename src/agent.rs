use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::context::AnalysisContext;
use crate::error::{Error, Result};
use crate::locate::{Confidence, ResolvedLocation};
use crate::process::{ProcessConfig, spawn_and_stream};
use crate::prompts::{
    AnalyzeVars, FileVars, FixVars, FocusVars, PromptEngine, PromptKind, QueueVars, ReviewerVars,
};
use crate::registry::ReviewerDefinition;
use crate::schema::{
    ANALYSIS_SCHEMA, AnalysisOutput, FIX_SCHEMA, FixOutput, FixStatus, envelope_cost,
    parse_analysis_output, parse_fix_output,
};
use crate::session::Finding;

/// Tools an analysis run may use. Anything else a reviewer asks for is dropped.
pub const READ_ONLY_TOOLS: &[&str] = &["Read", "Grep", "Glob"];

/// Tools a fix run gets. No shell: committing is done by the pipeline.
pub const FIX_TOOLS: &[&str] = &["Read", "Edit", "Write"];

/// Hard capability split between analysis and fix runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolMode {
    ReadOnly,
    Edit,
}

impl ToolMode {
    /// Tools granted for a run given what the reviewer requested.
    pub fn allowed(self, requested: &[String]) -> Vec<String> {
        match self {
            ToolMode::ReadOnly => {
                let tools: Vec<String> = requested
                    .iter()
                    .filter(|t| READ_ONLY_TOOLS.contains(&t.as_str()))
                    .cloned()
                    .collect();
                if tools.is_empty() {
                    vec!["Read".to_string()]
                } else {
                    tools
                }
            }
            ToolMode::Edit => FIX_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// A fix to apply, with its location already re-resolved against the
/// current file content.
#[derive(Debug, Clone)]
pub struct FixRequest {
    pub sequence: u32,
    pub finding: Finding,
    pub location: ResolvedLocation,
    /// Current lines around `location`.
    pub snippet: String,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FixReport {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub summary: Option<String>,
    pub cost_usd: Option<f64>,
}

/// The reasoning agent. Analysis must be unable to mutate files; fixes edit
/// the working tree but never commit.
pub trait AgentClient: Send + Sync {
    fn analyze(
        &self,
        reviewer: &ReviewerDefinition,
        context: &AnalysisContext,
    ) -> impl std::future::Future<Output = Result<AnalysisOutput>> + Send;

    fn apply_fix(&self, request: &FixRequest) -> impl std::future::Future<Output = Result<FixReport>> + Send;
}

/// Agent backed by the `claude` CLI.
pub struct ClaudeAgent {
    agent_binary: String,
    model: Option<String>,
    analyze_timeout: Option<Duration>,
    fix_timeout: Option<Duration>,
    prompts: PromptEngine,
    workdir: PathBuf,
    debug_dir: Option<PathBuf>,
}

impl ClaudeAgent {
    pub fn new(agent_binary: String, model: Option<String>, prompts: PromptEngine, workdir: PathBuf) -> Self {
        Self {
            agent_binary,
            model,
            analyze_timeout: None,
            fix_timeout: None,
            prompts,
            workdir,
            debug_dir: None,
        }
    }

    pub fn with_timeouts(mut self, analyze: Duration, fix: Duration) -> Self {
        self.analyze_timeout = Some(analyze);
        self.fix_timeout = Some(fix);
        self
    }

    /// Write prompts and raw responses under `dir`.
    pub fn with_debug_dir(mut self, dir: PathBuf) -> Self {
        self.debug_dir = Some(dir);
        self
    }

    /// Build the command line. The prompt itself goes over stdin.
    pub fn build_command(&self, mode: ToolMode, tools: &[String], system_prompt: Option<&str>) -> (String, Vec<String>) {
        let schema = match mode {
            ToolMode::ReadOnly => ANALYSIS_SCHEMA,
            ToolMode::Edit => FIX_SCHEMA,
        };
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--json-schema".to_string(),
            schema.to_string(),
            "--tools".to_string(),
            tools.join(","),
            "--permission-mode".to_string(),
            "bypassPermissions".to_string(),
        ];

        if let Some(system_prompt) = system_prompt {
            args.push("--system-prompt".to_string());
            args.push(system_prompt.to_string());
        }

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        (self.agent_binary.clone(), args)
    }

    async fn invoke(
        &self,
        label: &str,
        mode: ToolMode,
        tools: &[String],
        system_prompt: Option<&str>,
        prompt: String,
        timeout: Option<Duration>,
    ) -> Result<String> {
        self.write_debug(&format!("{label}-prompt.md"), &prompt);

        let (command, args) = self.build_command(mode, tools, system_prompt);
        let config = ProcessConfig {
            command,
            args,
            working_dir: self.workdir.clone(),
            timeout,
            log_prefix: format!("agent:{label}"),
            env: vec![],
            stdin_data: Some(prompt),
        };

        let output = spawn_and_stream(config).await.map_err(|e| Error::Agent(e.to_string()))?;
        let stdout = output.stdout_lines.join("\n");
        self.write_debug(&format!("{label}-response.json"), &stdout);

        if let Some(sig) = output.signal {
            return Err(Error::Agent(format!("agent killed by signal {sig}")));
        }
        if output.exit_code != 0 {
            let tail = output.stderr_lines.last().cloned().unwrap_or_default();
            return Err(Error::Agent(format!(
                "agent exited with code {}: {tail}",
                output.exit_code
            )));
        }
        Ok(stdout)
    }

    fn write_debug(&self, name: &str, content: &str) {
        let Some(ref dir) = self.debug_dir else {
            return;
        };
        let result = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(dir.join(name), content));
        if let Err(e) = result {
            warn!(file = name, "failed to write debug file: {e}");
        }
    }
}

fn analyze_vars(reviewer: &ReviewerDefinition, context: &AnalysisContext) -> AnalyzeVars {
    let snapshot = &context.snapshot;
    AnalyzeVars {
        reviewer: ReviewerVars {
            id: reviewer.id.to_string(),
            title: reviewer.title.clone(),
        },
        target: snapshot.target.clone(),
        base: snapshot.base.clone(),
        diff: snapshot.diff.clone(),
        files: snapshot.changed_files.iter().map(FileVars::from).collect(),
        explore: reviewer.explore,
        max_depth: context.max_depth,
        focus: context.focus.as_ref().map(|f| FocusVars {
            target: f.entry.target.clone(),
            reason: f.entry.reason.clone(),
            depth: f.entry.depth,
            content: f.content.clone(),
        }),
        queue: context
            .exploration
            .iter()
            .filter(|e| e.origin.as_ref() == Some(&reviewer.id))
            .map(|e| QueueVars {
                target: e.target.clone(),
                reason: e.reason.clone(),
                depth: e.depth,
                inspected: e.consumed,
            })
            .collect(),
    }
}

fn fix_vars(request: &FixRequest) -> FixVars {
    let finding = &request.finding;
    FixVars {
        sequence: request.sequence,
        title: finding.title.clone(),
        description: finding.description.clone(),
        scenario: finding.scenario.clone(),
        fix_plan: finding
            .fix_plan
            .clone()
            .or_else(|| finding.fix_summary.clone())
            .unwrap_or_else(|| finding.description.clone()),
        file: finding.file.clone(),
        line: request.location.line,
        hint_line: finding.line,
        confidence: match request.location.confidence {
            Confidence::Anchored => "confirmed by surrounding code",
            Confidence::LineText => "matched by line text only",
            Confidence::Hint => "unconfirmed",
        }
        .to_string(),
        snippet: request.snippet.clone(),
    }
}

impl AgentClient for ClaudeAgent {
    async fn analyze(&self, reviewer: &ReviewerDefinition, context: &AnalysisContext) -> Result<AnalysisOutput> {
        let prompt = self.prompts.render(PromptKind::Analyze, &analyze_vars(reviewer, context))?;
        let tools = ToolMode::ReadOnly.allowed(&reviewer.tools);
        let label = match context.focus {
            Some(ref f) => format!("{}-d{}", reviewer.id, f.entry.depth),
            None => reviewer.id.to_string(),
        };
        info!(reviewer = %reviewer.id, tools = %tools.join(","), "running analysis");

        let stdout = self
            .invoke(
                &label,
                ToolMode::ReadOnly,
                &tools,
                Some(&reviewer.prompt),
                prompt,
                self.analyze_timeout,
            )
            .await?;
        let output = parse_analysis_output(&stdout)?;
        debug!(reviewer = %reviewer.id, findings = output.findings.len(), follow_ups = output.follow_up.len(), "analysis parsed");
        Ok(output)
    }

    async fn apply_fix(&self, request: &FixRequest) -> Result<FixReport> {
        let prompt = self.prompts.render(PromptKind::Fix, &fix_vars(request))?;
        let tools = ToolMode::Edit.allowed(&[]);
        let label = format!("fix-{:03}", request.sequence);

        let stdout = self
            .invoke(&label, ToolMode::Edit, &tools, None, prompt, self.fix_timeout)
            .await?;
        let FixOutput {
            status,
            file,
            line,
            summary,
            error,
        } = parse_fix_output(&stdout)?;
        if status == FixStatus::Failed {
            return Err(Error::Agent(
                error.unwrap_or_else(|| "agent reported the fix as failed".to_string()),
            ));
        }
        Ok(FixReport {
            file,
            line,
            summary,
            cost_usd: envelope_cost(&stdout),
        })
    }
}

/// Current lines around a 1-based line, numbered, for fix prompts.
pub fn snippet_around(content: &str, line: u32, radius: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let idx = (line as usize).saturating_sub(1).min(lines.len() - 1);
    let start = idx.saturating_sub(radius);
    let end = (idx + radius + 1).min(lines.len());
    lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, l)| format!("{:>5} | {l}", start + i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Relative path check for agent-reported locations.
pub fn is_inside(workdir: &Path, file: &str) -> bool {
    let path = Path::new(file);
    !path.is_absolute()
        && !path.components().any(|c| matches!(c, std::path::Component::ParentDir))
        && workdir.join(path).starts_with(workdir)
}
