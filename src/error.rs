use std::path::PathBuf;

use crate::session::Phase;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("apply error: {0}")]
    Apply(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("agent output error: {0}")]
    Schema(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("illegal phase transition: {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;
