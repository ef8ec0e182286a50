use std::path::PathBuf;

use crate::registry::{ReviewerDefinition, ReviewerId};
use crate::session::{FixRecord, Finding};

/// Create a `Finding` with sensible defaults for tests.
pub fn make_finding(reviewer: &str, emission: u32) -> Finding {
    let reviewer = ReviewerId::parse(reviewer).unwrap();
    Finding {
        id: Finding::finding_id(&reviewer, emission),
        reviewer,
        emission,
        file: "src/main.rs".to_string(),
        line: 42,
        line_end: None,
        title: format!("issue {emission}"),
        description: format!("issue {emission} description"),
        scenario: None,
        fix_plan: Some("fix it".to_string()),
        fix_summary: None,
        report_only: false,
        anchor: None,
        sequence: None,
        fix: FixRecord::default(),
    }
}

pub fn make_definition(id: &str) -> ReviewerDefinition {
    ReviewerDefinition {
        id: ReviewerId::parse(id).unwrap(),
        title: id.to_string(),
        prompt: format!("Review for {id} issues."),
        tools: vec!["Read".to_string()],
        report_only: false,
        enabled: true,
        explore: true,
        source: PathBuf::from(format!("reviewers/{id}.md")),
    }
}
