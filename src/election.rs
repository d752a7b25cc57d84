use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::peer::Peer;

/// Outcome of one election round from the local node's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionTransition {
    /// The local node just took the coordinator role
    Won,
    /// The local node just gave up the coordinator role
    Lost,
    /// No role change
    Unchanged,
}

/// Non-blocking coordinator election: exactly one live member per domain
/// self-assigns the coordinator role and announces it.
///
/// The winner is the longest-tenured member (smallest alive timestamp); ties
/// go to the lowest `(host, port)`. The protocol re-runs on every membership
/// change for the lifetime of the process — there is no terminal state.
pub struct CoordinatorElection {
    local: Peer,
    is_coordinator: AtomicBool,
}

impl CoordinatorElection {
    pub fn new(local: Peer) -> Self {
        Self {
            local,
            is_coordinator: AtomicBool::new(false),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.is_coordinator.load(Ordering::Acquire)
    }

    /// Re-run the election over the current live members plus the local peer.
    pub fn evaluate(&self, live: &[Peer]) -> ElectionTransition {
        let winner = live
            .iter()
            .chain(std::iter::once(&self.local))
            .min_by(|a, b| Self::rank(a).cmp(&Self::rank(b)));

        let won = winner.map(|w| w == &self.local).unwrap_or(true);
        self.transition_to(won)
    }

    /// A remote peer claimed the coordinator role. Yield when its ordering
    /// beats ours; a worse claim is ignored and the next membership change
    /// re-asserts the local claim.
    pub fn on_announcement(&self, claimant: &Peer) -> ElectionTransition {
        if claimant == &self.local {
            return ElectionTransition::Unchanged;
        }
        if Self::rank(claimant) < Self::rank(&self.local) {
            self.transition_to(false)
        } else {
            debug!(claimant = %claimant, "ignoring coordinator claim with worse ordering");
            ElectionTransition::Unchanged
        }
    }

    fn transition_to(&self, coordinator: bool) -> ElectionTransition {
        let was = self.is_coordinator.swap(coordinator, Ordering::AcqRel);
        match (was, coordinator) {
            (false, true) => {
                info!(local = %self.local, "assumed coordinator role");
                ElectionTransition::Won
            }
            (true, false) => {
                info!(local = %self.local, "relinquished coordinator role");
                ElectionTransition::Lost
            }
            _ => ElectionTransition::Unchanged,
        }
    }

    fn rank(peer: &Peer) -> (u64, String, u16) {
        (
            peer.alive_since(),
            peer.host().to_string(),
            peer.port(),
        )
    }
}
