use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::domains_match;
use crate::membership::MembershipTable;
use crate::peer::Peer;

/// Receives higher-level membership events after the table has been updated.
pub trait MembershipListener: Send + Sync {
    fn member_joined(&self, peer: &Peer);
    fn member_left(&self, peer: &Peer);
}

/// Normalizes raw join/leave notifications from the transport into table
/// updates and listener fan-out.
///
/// Listener notifications for a join happen strictly after the peer is
/// visible through the table's `all()` snapshot.
pub struct MembershipEventDispatcher {
    table: Arc<MembershipTable>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
}

impl MembershipEventDispatcher {
    pub fn new(table: Arc<MembershipTable>) -> Self {
        Self {
            table,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn table(&self) -> &Arc<MembershipTable> {
        &self.table
    }

    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().push(listener);
    }

    /// A peer appeared. Peers outside the local domain are ignored; the
    /// admission gate may still veto the add. Returns whether the peer
    /// entered the live set.
    pub fn member_joined(&self, peer: Peer) -> bool {
        if !domains_match(peer.domain(), self.table.domain()) {
            debug!(peer = %peer, "ignoring join from foreign domain");
            return false;
        }

        if !self.table.add(peer.clone()) {
            return false;
        }
        info!(peer = %peer, "member joined group");

        // The table already contains the peer; every listener observes a
        // consistent snapshot.
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.member_joined(&peer);
        }
        true
    }

    /// A peer disappeared. Removes it from the table and the well-known
    /// pending-response tracking, then fans the event out.
    pub fn member_left(&self, peer: &Peer) {
        if !domains_match(peer.domain(), self.table.domain()) {
            return;
        }
        if !self.table.contains(peer) {
            return;
        }
        self.table.remove(peer);
        info!(peer = %peer, "member left group");

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.member_left(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        joins: AtomicUsize,
        leaves: AtomicUsize,
        visible_at_join: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Self {
            Self {
                joins: AtomicUsize::new(0),
                leaves: AtomicUsize::new(0),
                visible_at_join: AtomicUsize::new(0),
            }
        }
    }

    struct TableCheckingListener {
        table: Arc<MembershipTable>,
        inner: Arc<CountingListener>,
    }

    impl MembershipListener for TableCheckingListener {
        fn member_joined(&self, peer: &Peer) {
            self.inner.joins.fetch_add(1, Ordering::SeqCst);
            if self.table.all().contains(peer) {
                self.inner.visible_at_join.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn member_left(&self, _peer: &Peer) {
            self.inner.leaves.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_join_visible_in_table_before_fan_out() {
        let table = Arc::new(MembershipTable::new("grp1"));
        let dispatcher = MembershipEventDispatcher::new(table.clone());
        let counts = Arc::new(CountingListener::new());
        dispatcher.add_listener(Arc::new(TableCheckingListener {
            table,
            inner: counts.clone(),
        }));

        let peer = Peer::new("10.0.0.1", 4000, "grp1");
        assert!(dispatcher.member_joined(peer.clone()));

        assert_eq!(counts.joins.load(Ordering::SeqCst), 1);
        assert_eq!(counts.visible_at_join.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_join_notifies_once() {
        let table = Arc::new(MembershipTable::new("grp1"));
        let dispatcher = MembershipEventDispatcher::new(table.clone());
        let counts = Arc::new(CountingListener::new());
        dispatcher.add_listener(Arc::new(TableCheckingListener {
            table,
            inner: counts.clone(),
        }));

        let peer = Peer::new("10.0.0.1", 4000, "grp1");
        assert!(dispatcher.member_joined(peer.clone()));
        assert!(!dispatcher.member_joined(peer));
        assert_eq!(counts.joins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_foreign_domain_join_ignored() {
        let table = Arc::new(MembershipTable::new("grp1"));
        let dispatcher = MembershipEventDispatcher::new(table.clone());
        assert!(!dispatcher.member_joined(Peer::new("10.0.0.1", 4000, "grp2")));
        assert!(table.is_empty());
    }

    #[test]
    fn test_leave_removes_then_notifies() {
        let table = Arc::new(MembershipTable::new("grp1"));
        let dispatcher = MembershipEventDispatcher::new(table.clone());
        let counts = Arc::new(CountingListener::new());
        dispatcher.add_listener(Arc::new(TableCheckingListener {
            table: table.clone(),
            inner: counts.clone(),
        }));

        let peer = Peer::new("10.0.0.1", 4000, "grp1");
        dispatcher.member_joined(peer.clone());
        dispatcher.member_left(&peer);

        assert_eq!(counts.leaves.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());

        // Leaving again is a no-op and does not notify.
        dispatcher.member_left(&peer);
        assert_eq!(counts.leaves.load(Ordering::SeqCst), 1);
    }
}
