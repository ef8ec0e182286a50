use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::{FixState, ReviewSession};
use crate::store::SessionHandle;

/// Assign sequence numbers 1..N in merge order: reviewer registration order,
/// then emission order. Returns the number of sequenced findings.
///
/// Idempotent: an unchanged finding set keeps its numbering. Renumbering is
/// refused once any fix has started.
pub fn sequence(handle: &SessionHandle) -> Result<usize> {
    handle.update(assign_sequence)
}

pub fn assign_sequence(session: &mut ReviewSession) -> Result<usize> {
    let order = merge_order(session)?;

    let unchanged = order
        .iter()
        .enumerate()
        .all(|(i, &idx)| session.findings[idx].sequence == Some(i as u32 + 1));
    if unchanged {
        debug!(count = order.len(), "sequence numbers already assigned");
        return Ok(order.len());
    }

    if let Some(started) = session
        .findings
        .iter()
        .find(|f| f.fix.state != FixState::NotStarted)
    {
        return Err(Error::Store(format!(
            "cannot renumber findings: fix for {} already {}",
            started.id, started.fix.state
        )));
    }

    for (i, &idx) in order.iter().enumerate() {
        session.findings[idx].sequence = Some(i as u32 + 1);
    }
    info!(count = order.len(), "findings sequenced");
    Ok(order.len())
}

/// Indices into `session.findings` in merge order.
fn merge_order(session: &ReviewSession) -> Result<Vec<usize>> {
    let mut keyed = Vec::with_capacity(session.findings.len());
    for (idx, finding) in session.findings.iter().enumerate() {
        let position = session.reviewer_position(&finding.reviewer).ok_or_else(|| {
            Error::Store(format!(
                "finding {} belongs to unknown reviewer {}",
                finding.id, finding.reviewer
            ))
        })?;
        keyed.push(((position, finding.emission), idx));
    }
    keyed.sort_by_key(|(key, _)| *key);
    Ok(keyed.into_iter().map(|(_, idx)| idx).collect())
}
