use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::{Cli, CliCommand};
use crate::error::{Error, Result};
use crate::exploration::MAX_EXPLORATION_DEPTH;
use crate::git::validate_branch_name;
use crate::session::ApplyMode;

pub const DEFAULT_CONFIG_FILE: &str = ".revfix.toml";
pub const CONFIG_ENV: &str = "REVFIX_CONFIG";

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub reviewers_dir: Option<String>,
    pub enabled_reviewers: Option<Vec<String>>,
    pub report_only_reviewers: Option<Vec<String>>,
    pub state_dir: Option<String>,
    pub base_branch: Option<String>,
    pub agent_binary: Option<String>,
    pub agent_model: Option<String>,
    pub analyze_timeout: Option<u64>,
    pub fix_timeout: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub max_exploration_depth: Option<u32>,
    pub mode: Option<String>,
    pub publish: Option<bool>,
    pub publish_retries: Option<u32>,
    pub fix_branch_prefix: Option<String>,
    pub debug: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub reviewers_dir: PathBuf,
    pub enabled_reviewers: Option<Vec<String>>,
    pub report_only_reviewers: Vec<String>,
    /// `None` means `.revfix/sessions` under the repository root.
    pub state_dir: Option<PathBuf>,
    pub base_branch: String,
    pub agent_binary: String,
    pub agent_model: Option<String>,
    /// Seconds.
    pub analyze_timeout: u64,
    /// Seconds.
    pub fix_timeout: u64,
    pub max_concurrency: usize,
    pub max_exploration_depth: u32,
    pub mode: ApplyMode,
    pub publish: bool,
    pub publish_retries: u32,
    pub fix_branch_prefix: String,
    pub debug: bool,
}

impl Config {
    /// Load the config file (`--config`, then `$REVFIX_CONFIG`, then
    /// `.revfix.toml`) and merge CLI flags over it. A missing default file
    /// means all defaults; a missing explicit file is an error.
    pub fn load(cli: &Cli) -> Result<Self> {
        let explicit = cli
            .config
            .clone()
            .or_else(|| std::env::var(CONFIG_ENV).ok().filter(|v| !v.is_empty()));
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_FILE));

        let file_config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            parse_config(&content)?
        } else if explicit.is_some() {
            return Err(Error::ConfigNotFound(path));
        } else {
            ConfigFile::default()
        };

        let config = merge(file_config, cli)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.analyze_timeout == 0 || self.fix_timeout == 0 {
            return Err(Error::Configuration("timeouts must be > 0".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Configuration("max_concurrency must be > 0".to_string()));
        }
        if self.max_exploration_depth > MAX_EXPLORATION_DEPTH {
            return Err(Error::Configuration(format!(
                "max_exploration_depth must be <= {MAX_EXPLORATION_DEPTH}"
            )));
        }
        validate_branch_name(&self.fix_branch_prefix).map_err(|e| {
            Error::Configuration(format!("invalid fix_branch_prefix: {e}"))
        })?;
        Ok(())
    }

    /// Resolve the state directory against the repository root.
    pub fn state_dir(&self, repo_root: &Path) -> PathBuf {
        match self.state_dir {
            Some(ref dir) => repo_root.join(dir),
            None => crate::store::MetadataStore::default_dir(repo_root),
        }
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    if let Some(ref mode) = config.mode {
        parse_mode(mode)?;
    }
    Ok(config)
}

fn parse_mode(mode: &str) -> Result<ApplyMode> {
    match mode {
        "apply" => Ok(ApplyMode::Apply),
        "report" => Ok(ApplyMode::Report),
        other => Err(Error::Configuration(format!(
            "unknown mode: {other} (expected: apply, report)"
        ))),
    }
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    let (cli_base, report_only, local) = match cli.command {
        CliCommand::Review {
            ref base,
            report_only,
            local,
            ..
        } => (base.clone(), report_only, local),
        _ => (None, false, false),
    };

    let mode = if report_only {
        ApplyMode::Report
    } else {
        file.mode.as_deref().map(parse_mode).transpose()?.unwrap_or_default()
    };

    Ok(Config {
        reviewers_dir: PathBuf::from(
            file.reviewers_dir
                .unwrap_or_else(|| ".revfix/reviewers".to_string()),
        ),
        enabled_reviewers: file.enabled_reviewers,
        report_only_reviewers: file.report_only_reviewers.unwrap_or_default(),
        state_dir: file.state_dir.map(PathBuf::from),
        base_branch: cli_base
            .or(file.base_branch)
            .unwrap_or_else(|| "main".to_string()),
        agent_binary: cli
            .agent_binary
            .clone()
            .or(file.agent_binary)
            .unwrap_or_else(|| "claude".to_string()),
        agent_model: cli.agent_model.clone().or(file.agent_model),
        analyze_timeout: file.analyze_timeout.unwrap_or(900),
        fix_timeout: file.fix_timeout.unwrap_or(600),
        max_concurrency: cli.max_concurrency.or(file.max_concurrency).unwrap_or(8),
        max_exploration_depth: file.max_exploration_depth.unwrap_or(MAX_EXPLORATION_DEPTH),
        mode,
        publish: !local && file.publish.unwrap_or(true),
        publish_retries: file.publish_retries.unwrap_or(3),
        fix_branch_prefix: file
            .fix_branch_prefix
            .unwrap_or_else(|| "revfix".to_string()),
        debug: cli.debug || file.debug.unwrap_or(false),
    })
}
