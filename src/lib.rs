pub mod agent;
pub mod applier;
pub mod cli;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod exploration;
pub mod git;
pub mod locate;
pub mod pipeline;
pub mod process;
pub mod prompts;
pub mod publish;
pub mod registry;
pub mod report;
pub mod schema;
pub mod sequencer;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_helpers;
