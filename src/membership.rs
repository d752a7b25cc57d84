use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info};

use crate::domains_match;
use crate::peer::Peer;

/// Per-domain/sub-domain admission and tracking policy. An implementation can
/// refuse admission of a peer without the membership layer knowing why.
pub trait GroupManagementAgent: Send + Sync {
    /// Called before a peer enters the live set. Returning `false` vetoes the
    /// add; the peer is remembered as known but stays out of the live set.
    fn on_member_added(&self, peer: &Peer) -> bool;

    /// Called after a peer left the live set.
    fn on_member_removed(&self, peer: &Peer);
}

#[derive(Default)]
struct TableState {
    /// Currently-live members, in insertion order
    live: Vec<Peer>,
    /// Well-known candidates; may or may not be alive at any given moment
    well_known: Vec<Peer>,
    /// Peers refused by the admission gate but still remembered
    vetoed: Vec<Peer>,
    /// Well-known members that have not yet acknowledged our member list
    unresponsive_wka: Vec<Peer>,
}

/// The single source of truth for who is alive in one domain.
///
/// All mutation goes through `add`/`remove`/`clear`; the internal collection
/// is never handed out by reference. `all()` returns a snapshot that callers
/// must tolerate going stale.
pub struct MembershipTable {
    domain: Vec<u8>,
    state: RwLock<TableState>,
    admission: RwLock<Option<Arc<dyn GroupManagementAgent>>>,
}

impl MembershipTable {
    pub fn new(domain: impl Into<Vec<u8>>) -> Self {
        Self {
            domain: domain.into(),
            state: RwLock::new(TableState::default()),
            admission: RwLock::new(None),
        }
    }

    pub fn domain(&self) -> &[u8] {
        &self.domain
    }

    pub fn set_admission_gate(&self, gate: Arc<dyn GroupManagementAgent>) {
        *self.admission.write() = Some(gate);
    }

    /// Insert a peer into the live set.
    ///
    /// Rejected when the peer is already present, belongs to another domain,
    /// or the admission gate vetoes it. A vetoed peer is remembered as known
    /// but not live. Never signals an error.
    pub fn add(&self, peer: Peer) -> bool {
        if !domains_match(peer.domain(), &self.domain) {
            debug!(peer = %peer, "ignoring peer from foreign domain");
            return false;
        }

        let gate = self.admission.read().clone();
        let mut state = self.state.write();
        if state.live.contains(&peer) {
            return false;
        }

        if let Some(gate) = gate {
            if !gate.on_member_added(&peer) {
                if !state.vetoed.contains(&peer) {
                    info!(peer = %peer, "admission refused, remembering peer as known only");
                    state.vetoed.push(peer);
                }
                return false;
            }
        }

        state.vetoed.retain(|p| p != &peer);
        state.live.push(peer);
        true
    }

    /// Remove by `(host, port)`; removing a non-member is a no-op.
    pub fn remove(&self, peer: &Peer) {
        let was_present = {
            let mut state = self.state.write();
            let before = state.live.len();
            state.live.retain(|p| p != peer);
            state.unresponsive_wka.retain(|p| p != peer);
            state.live.len() != before
        };

        if was_present {
            if let Some(gate) = self.admission.read().clone() {
                gate.on_member_removed(peer);
            }
        }
    }

    /// Empty the live set (full reset of the domain's group).
    pub fn clear(&self) {
        self.state.write().live.clear();
    }

    /// Snapshot of the current live peers, in insertion order.
    pub fn all(&self) -> Vec<Peer> {
        self.state.read().live.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().live.is_empty()
    }

    pub fn has_members(&self) -> bool {
        !self.is_empty()
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.state.read().live.contains(peer)
    }

    pub fn get(&self, host: &str, port: u16) -> Option<Peer> {
        self.state
            .read()
            .live
            .iter()
            .find(|p| p.same_address(host, port))
            .cloned()
    }

    /// The member that joined earliest and has survived longest: smallest
    /// alive timestamp, first one found on ties.
    pub fn longest_lived(&self) -> Option<Peer> {
        let state = self.state.read();
        let mut best: Option<&Peer> = None;
        for peer in &state.live {
            match best {
                Some(current) if peer.alive_since() >= current.alive_since() => {}
                _ => best = Some(peer),
            }
        }
        best.cloned()
    }

    /// Uniformly random live member, if any.
    pub fn random_member(&self) -> Option<Peer> {
        let state = self.state.read();
        if state.live.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..state.live.len());
        state.live.get(index).cloned()
    }

    pub fn add_well_known(&self, peer: Peer) {
        let mut state = self.state.write();
        if !state.well_known.contains(&peer) {
            state.well_known.push(peer);
        }
    }

    pub fn remove_well_known(&self, peer: &Peer) {
        self.state.write().well_known.retain(|p| p != peer);
    }

    pub fn well_known(&self) -> Vec<Peer> {
        self.state.read().well_known.clone()
    }

    pub fn is_well_known(&self, peer: &Peer) -> bool {
        self.state.read().well_known.contains(peer)
    }

    /// Track a well-known member that has not acknowledged our member list;
    /// the retry task keeps resending until it answers.
    pub fn mark_wka_unresponsive(&self, peer: Peer) {
        let mut state = self.state.write();
        if !state.unresponsive_wka.contains(&peer) {
            state.unresponsive_wka.push(peer);
        }
    }

    pub fn mark_wka_responsive(&self, peer: &Peer) {
        self.state.write().unresponsive_wka.retain(|p| p != peer);
    }

    pub fn unresponsive_wka(&self) -> Vec<Peer> {
        self.state.read().unresponsive_wka.clone()
    }
}

/// Per-domain sub-tables for multi-tenant group management.
pub struct TableRegistry {
    tables: DashMap<Vec<u8>, Arc<MembershipTable>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    pub fn register(&self, table: Arc<MembershipTable>) {
        self.tables.insert(table.domain().to_vec(), table);
    }

    pub fn get(&self, domain: &[u8]) -> Option<Arc<MembershipTable>> {
        self.tables.get(domain).map(|entry| entry.clone())
    }

    pub fn get_or_create(&self, domain: &[u8]) -> Arc<MembershipTable> {
        self.tables
            .entry(domain.to_vec())
            .or_insert_with(|| Arc::new(MembershipTable::new(domain.to_vec())))
            .clone()
    }

    pub fn domains(&self) -> Vec<Vec<u8>> {
        self.tables.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes admission decisions to the agent registered for the member's
/// sub-domain (or the default sub-domain when the member has none).
pub(crate) struct SubDomainGate {
    default_sub_domain: String,
    agents: RwLock<HashMap<String, Arc<dyn GroupManagementAgent>>>,
}

impl SubDomainGate {
    pub fn new(default_sub_domain: impl Into<String>) -> Self {
        Self {
            default_sub_domain: default_sub_domain.into(),
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, sub_domain: impl Into<String>, agent: Arc<dyn GroupManagementAgent>) {
        self.agents.write().insert(sub_domain.into(), agent);
    }

    pub fn get(&self, sub_domain: &str) -> Option<Arc<dyn GroupManagementAgent>> {
        self.agents.read().get(sub_domain).cloned()
    }

    fn agent_for(&self, peer: &Peer) -> Option<Arc<dyn GroupManagementAgent>> {
        let sub = peer.sub_domain().unwrap_or(&self.default_sub_domain);
        self.agents.read().get(sub).cloned()
    }
}

impl GroupManagementAgent for SubDomainGate {
    fn on_member_added(&self, peer: &Peer) -> bool {
        match self.agent_for(peer) {
            Some(agent) => agent.on_member_added(peer),
            None => true,
        }
    }

    fn on_member_removed(&self, peer: &Peer) {
        if let Some(agent) = self.agent_for(peer) {
            agent.on_member_removed(peer);
        }
    }
}
