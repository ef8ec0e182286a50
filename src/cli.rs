use clap::{Parser, Subcommand};

/// revfix: concurrent code review with sequential, resumable fixes
#[derive(Parser, Debug, Clone)]
#[command(name = "revfix", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,

    /// Path to config file (default: .revfix.toml, or $REVFIX_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Verbose logging and agent prompt/response capture
    #[arg(long, global = true)]
    pub debug: bool,

    /// Agent binary to use (default: claude)
    #[arg(long, global = true)]
    pub agent_binary: Option<String>,

    /// Model for the agent to use
    #[arg(long, global = true)]
    pub agent_model: Option<String>,

    /// Maximum reviewers analyzing at once
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Start a review session for TARGET and run it to completion
    Review {
        /// Branch or ref under review
        target: String,

        /// Base branch to diff against
        #[arg(long)]
        base: Option<String>,

        /// Record findings without applying fixes
        #[arg(long)]
        report_only: bool,

        /// Keep everything local: no push, no pull request
        #[arg(long)]
        local: bool,
    },

    /// Resume a session (default: the most recent one)
    Resume {
        session_id: Option<String>,

        /// Relaunch reviewers that failed in a previous run
        #[arg(long)]
        retry_failed: bool,
    },

    /// Print the report of a session without running anything
    Status { session_id: Option<String> },

    /// List the loaded reviewers
    Reviewers,
}
