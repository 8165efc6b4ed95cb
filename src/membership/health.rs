//! Status Translation
//!
//! Maps a node's lifecycle status onto the three-level signal accepted
//! by the store's TTL checks. Pure function of its inputs: the status
//! being reported and, when available, the status this process
//! currently observes for itself.

use crate::node::NodeStatus;
use crate::store::CheckStatus;

/// Map a lifecycle status onto the TTL check signal.
fn status_signal(status: NodeStatus) -> CheckStatus {
    match status {
        NodeStatus::None | NodeStatus::Created | NodeStatus::Joining | NodeStatus::Active => {
            CheckStatus::Pass
        }
        NodeStatus::ShuttingDown | NodeStatus::Stopping => CheckStatus::Warn,
        NodeStatus::Dead => CheckStatus::Critical,
    }
}

fn severity(status: CheckStatus) -> u8 {
    match status {
        CheckStatus::Pass => 0,
        CheckStatus::Warn => 1,
        CheckStatus::Critical => 2,
    }
}

/// Translate a reported status, tempered by the locally observed one.
///
/// A locally observed teardown state forces critical no matter what is
/// being reported, so a node never keeps asserting health after it has
/// started going away. Otherwise the more severe of the two mappings
/// wins.
pub fn translate_status(reported: NodeStatus, local: Option<NodeStatus>) -> CheckStatus {
    let base = status_signal(reported);

    match local {
        None => base,
        Some(observed) if observed.is_terminating() => CheckStatus::Critical,
        Some(observed) => {
            let local_signal = status_signal(observed);
            if severity(local_signal) > severity(base) {
                local_signal
            } else {
                base
            }
        }
    }
}
