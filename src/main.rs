use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use revfix::agent::ClaudeAgent;
use revfix::cli::{Cli, CliCommand};
use revfix::config::Config;
use revfix::coordinator::CoordinatorOptions;
use revfix::error::{Error, Result};
use revfix::git::{GitCli, GitOperations};
use revfix::pipeline::{Pipeline, PipelineOptions, SessionRequest, start_session};
use revfix::prompts::PromptEngine;
use revfix::publish::GhPublisher;
use revfix::registry::ReviewerRegistry;
use revfix::report::render_report;
use revfix::session::Phase;
use revfix::store::{MetadataStore, SessionHandle};

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_writer(std::io::stderr)
        .init();
}

/// Flip the returned flag on SIGINT or SIGTERM.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    let _ = tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        warn!("cancellation requested, finishing in-flight work");
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(Error::Interrupted) => {
            eprintln!("interrupted; resume with `revfix resume`");
            130
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(&cli)?;
    info!(?config, "config loaded");

    let cwd = std::env::current_dir()?;
    let repo_root = match GitCli::discover(&cwd) {
        Ok(git) => git.workdir().to_path_buf(),
        Err(_) => cwd,
    };
    let store = MetadataStore::new(config.state_dir(&repo_root));

    match cli.command {
        CliCommand::Reviewers => {
            let registry = load_registry(&config, &repo_root)?;
            for def in registry.all() {
                let mut flags = Vec::new();
                if !def.enabled {
                    flags.push("disabled");
                }
                if def.report_only {
                    flags.push("report-only");
                }
                if def.explore {
                    flags.push("explore");
                }
                println!("{}\t{}\t{}", def.id, def.title, flags.join(","));
            }
            Ok(0)
        }
        CliCommand::Status { ref session_id } => {
            let handle = store.load_or_latest(session_id.as_deref())?;
            print!("{}", render_report(&handle.snapshot()?));
            Ok(0)
        }
        CliCommand::Review { ref target, .. } => {
            let registry = load_registry(&config, &repo_root)?;
            let request = SessionRequest {
                target: target.clone(),
                base: config.base_branch.clone(),
                mode: config.mode,
                publish: config.publish,
                debug: config.debug,
            };
            let handle = start_session(&store, &registry, &request)?;
            eprintln!("[revfix] Session: {}", handle.id());
            drive(&config, &repo_root, registry, &handle, false).await
        }
        CliCommand::Resume {
            ref session_id,
            retry_failed,
        } => {
            let registry = load_registry(&config, &repo_root)?;
            let handle = store.load_or_latest(session_id.as_deref())?;
            eprintln!("[revfix] Resuming session: {}", handle.id());
            drive(&config, &repo_root, registry, &handle, retry_failed).await
        }
    }
}

fn load_registry(config: &Config, repo_root: &Path) -> Result<ReviewerRegistry> {
    ReviewerRegistry::load_all(&repo_root.join(&config.reviewers_dir))?.with_selection(
        config.enabled_reviewers.as_deref(),
        &config.report_only_reviewers,
    )
}

async fn drive(
    config: &Config,
    repo_root: &Path,
    registry: ReviewerRegistry,
    handle: &SessionHandle,
    retry_failed: bool,
) -> Result<i32> {
    let session = handle.snapshot()?;
    let prompts = PromptEngine::new(Some(repo_root.join(".revfix").join("prompts")));
    let mut agent = ClaudeAgent::new(
        config.agent_binary.clone(),
        config.agent_model.clone(),
        prompts,
        repo_root.to_path_buf(),
    )
    .with_timeouts(
        Duration::from_secs(config.analyze_timeout),
        Duration::from_secs(config.fix_timeout),
    );
    if session.debug || config.debug {
        agent = agent.with_debug_dir(handle.debug_dir());
    }

    let options = PipelineOptions::new(
        CoordinatorOptions {
            max_concurrency: config.max_concurrency,
            unit_timeout: Duration::from_secs(config.analyze_timeout),
            max_depth: config.max_exploration_depth,
            retry_failed,
        },
        &config.fix_branch_prefix,
        config.publish_retries,
    );
    let pipeline = Pipeline::new(
        Arc::new(agent),
        Arc::new(GitCli::new(PathBuf::from(repo_root))),
        Arc::new(GhPublisher::new(repo_root.to_path_buf())),
        registry,
        options,
    );

    match pipeline.run(handle, Some(shutdown_signal())).await? {
        Phase::Done => {
            eprintln!("[revfix] Report written to {}", handle.report_path().display());
            Ok(0)
        }
        phase => {
            eprintln!("[revfix] Session ended in phase {phase}");
            Ok(1)
        }
    }
}
