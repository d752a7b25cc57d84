use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::channel::{probe_endpoint, NodeChannel};
use crate::config::ClusterConfig;
use crate::dispatcher::MembershipEventDispatcher;
use crate::domains_match;
use crate::messenger::GroupMessenger;
use crate::peer::Peer;
use crate::wire::{self, flags, Envelope, Payload, WirePeer};
use crate::{current_timestamp_ms, Result};

/// Consecutive failed liveness probes before a member is declared gone
const PROBE_FAILURE_THRESHOLD: usize = 3;

/// Pluggable membership discovery strategy.
#[async_trait]
pub trait MembershipScheme: Send + Sync {
    /// Wire the scheme onto the channel and discover the initial peer set.
    /// For WKA this blocks until at least one well-known member is reachable
    /// (or none are configured).
    async fn init(&self) -> Result<()>;

    /// Join the domain. For WKA this sends JOIN to the well-known members
    /// and adopts the first usable member list; for multicast membership
    /// arrives asynchronously and this is a no-op.
    async fn join_group(&self) -> Result<()>;

    /// Scheme-specific processing when a JOIN arrives from a new member.
    async fn process_join(&self, joiner: &Peer);

    /// Stop background tasks.
    async fn stop(&self);
}

/// Well-known-address discovery: the local node bootstraps from a fixed list
/// of candidate addresses, probing each for reachability and joining through
/// whichever answers.
pub struct WkaScheme {
    channel: Arc<NodeChannel>,
    dispatcher: Arc<MembershipEventDispatcher>,
    messenger: Arc<GroupMessenger>,
    local: Peer,
    config: ClusterConfig,
    shutdown: Arc<AtomicBool>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WkaScheme {
    pub fn new(
        channel: Arc<NodeChannel>,
        dispatcher: Arc<MembershipEventDispatcher>,
        messenger: Arc<GroupMessenger>,
        local: Peer,
        config: ClusterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            dispatcher,
            messenger,
            local,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Probe a candidate with a few short connection attempts.
    async fn can_connect(&self, peer: &Peer) -> bool {
        for attempt in 0..self.config.probe_attempts.max(1) {
            if probe_endpoint(&peer.endpoint(), self.config.connect_timeout).await {
                return true;
            }
            debug!(peer = %peer, attempt, "reachability probe failed");
        }
        false
    }

    fn spawn_background_tasks(&self) {
        let mut tasks = self.tasks.lock();

        // Liveness probing of current members; a member that fails several
        // consecutive probes is treated as disappeared.
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = Arc::clone(&self.shutdown);
        let ping_interval = self.config.ping_interval;
        let connect_timeout = self.config.connect_timeout;
        tasks.push(tokio::spawn(async move {
            let mut failures: HashMap<Peer, usize> = HashMap::new();
            let mut ticker = interval(ping_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let members = dispatcher.table().all();
                failures.retain(|peer, _| members.contains(peer));
                for peer in members {
                    if probe_endpoint(&peer.endpoint(), connect_timeout).await {
                        failures.remove(&peer);
                        continue;
                    }
                    let count = failures.entry(peer.clone()).or_insert(0);
                    *count += 1;
                    if *count >= PROBE_FAILURE_THRESHOLD {
                        warn!(peer = %peer, "member failed liveness probes, removing");
                        failures.remove(&peer);
                        dispatcher.member_left(&peer);
                    }
                }
            }
        }));

        // Keep re-sending the member list to well-known members that have
        // not yet acknowledged it.
        let channel = Arc::clone(&self.channel);
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = Arc::clone(&self.shutdown);
        let local = self.local.clone();
        let config = self.config.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(config.member_list_retry_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                for target in dispatcher.table().unresponsive_wka() {
                    send_member_list(&channel, &dispatcher, &local, &config, &target).await;
                }
            }
        }));
    }
}

async fn send_member_list(
    channel: &Arc<NodeChannel>,
    dispatcher: &Arc<MembershipEventDispatcher>,
    local: &Peer,
    config: &ClusterConfig,
    target: &Peer,
) {
    let table = dispatcher.table();
    let mut members: Vec<WirePeer> = table.all().iter().map(WirePeer::from).collect();
    members.push(WirePeer::from(local));

    let envelope = Envelope::new(
        table.domain().to_vec(),
        flags::MEMBERSHIP_MSG,
        Payload::MemberList { members },
    );
    match channel
        .request(&target.endpoint(), envelope, config.rpc_timeout)
        .await
    {
        Ok(Some(_)) => {
            table.mark_wka_responsive(target);
        }
        Ok(None) => {
            debug!(peer = %target, "no response to member list, will retry");
            table.mark_wka_unresponsive(target.clone());
        }
        Err(err) => {
            warn!(peer = %target, error = %err, "could not send member list");
            table.mark_wka_unresponsive(target.clone());
        }
    }
}

#[async_trait]
impl MembershipScheme for WkaScheme {
    async fn init(&self) -> Result<()> {
        let table = self.dispatcher.table();
        let candidates: Vec<Peer> = self
            .config
            .wka_members
            .iter()
            .filter(|member| !self.local.same_address(&member.host, member.port))
            .map(|member| {
                Peer::new(member.host.clone(), member.port, table.domain().to_vec())
            })
            .collect();

        for candidate in &candidates {
            table.add_well_known(candidate.clone());
        }

        if candidates.is_empty() {
            info!("no well-known members configured besides the local node");
            self.spawn_background_tasks();
            return Ok(());
        }

        let mut reachable_any = false;
        let mut unreachable = Vec::new();
        for candidate in candidates {
            if self.can_connect(&candidate).await {
                info!(peer = %candidate, "well-known member reachable");
                self.dispatcher.member_joined(candidate);
                reachable_any = true;
            } else {
                info!(peer = %candidate, "could not connect to well-known member");
                unreachable.push(candidate);
            }
        }

        // The node must not proceed un-joined: when every candidate is down,
        // retry until at least one comes up.
        while !reachable_any {
            info!(
                candidates = unreachable.len(),
                retry_secs = self.config.wka_retry_interval.as_secs(),
                "no well-known member reachable, waiting"
            );
            tokio::time::sleep(self.config.wka_retry_interval).await;
            for candidate in &unreachable {
                if probe_endpoint(&candidate.endpoint(), self.config.connect_timeout).await {
                    info!(peer = %candidate, "well-known member became reachable");
                    self.dispatcher.member_joined(candidate.clone());
                    reachable_any = true;
                    break;
                }
            }
        }

        self.spawn_background_tasks();
        Ok(())
    }

    async fn join_group(&self) -> Result<()> {
        let table = self.dispatcher.table();
        let mut targets = table.all();
        if targets.is_empty() {
            debug!("no live well-known members, starting as first node");
            return Ok(());
        }

        let replies = loop {
            info!(targets = targets.len(), "sending JOIN to well-known members");
            let mut tasks = Vec::with_capacity(targets.len());
            for target in &targets {
                let channel = Arc::clone(&self.channel);
                let endpoint = target.endpoint();
                let target = target.clone();
                let envelope = Envelope::new(
                    table.domain().to_vec(),
                    flags::MEMBERSHIP_MSG,
                    Payload::Join {
                        joiner: WirePeer::from(&self.local),
                    },
                );
                let timeout = self.config.rpc_timeout;
                tasks.push(tokio::spawn(async move {
                    (target, channel.request(&endpoint, envelope, timeout).await)
                }));
            }

            let mut replies = Vec::new();
            for task in tasks {
                if let Ok((target, Ok(Some(reply)))) = task.await {
                    replies.push((target, reply));
                }
            }
            if !replies.is_empty() {
                break replies;
            }

            info!("no responses received from well-known members");
            tokio::time::sleep(self.config.join_retry_interval).await;
            targets = table.all();
            if targets.is_empty() {
                warn!("there are no well-known members left to join through");
                return Ok(());
            }
        };

        let mut adopted = false;
        for (responder, reply) in replies {
            let members = match reply.payload {
                Payload::MemberList { members } => members,
                _ => {
                    // Answered, but without a member list: the candidate is
                    // not serving this domain. Drop it.
                    debug!(peer = %responder, "well-known member returned no member list, removing");
                    table.remove(&responder);
                    table.remove_well_known(&responder);
                    continue;
                }
            };

            // A well-known member that turns out to belong to another domain
            // is pruned right away.
            let responder_foreign = members.iter().any(|member| {
                responder.same_address(&member.host, member.port)
                    && !domains_match(&member.domain, table.domain())
            });

            if !adopted {
                adopted = true;
                table.clear();
                for member in members {
                    let peer = member.into_peer();
                    if peer == self.local {
                        continue;
                    }
                    // Foreign-domain entries are dropped by the dispatcher.
                    self.dispatcher.member_joined(peer);
                }
                info!(
                    members = table.len(),
                    "adopted member list from {responder}"
                );
            }

            if responder_foreign {
                debug!(peer = %responder, "well-known member belongs to another domain, removing");
                table.remove(&responder);
                table.remove_well_known(&responder);
            }
        }

        Ok(())
    }

    async fn process_join(&self, joiner: &Peer) {
        let table = self.dispatcher.table();
        let newly_added = self.dispatcher.member_joined(joiner.clone());

        // Both follow-ups run off-task: this method is called from the
        // connection that delivered the JOIN, and their acknowledgments
        // arrive through that same connection.
        if table.is_well_known(joiner) {
            info!(peer = %joiner, "a well-known member joined, sending member list");
            let channel = Arc::clone(&self.channel);
            let dispatcher = Arc::clone(&self.dispatcher);
            let local = self.local.clone();
            let config = self.config.clone();
            let target = joiner.clone();
            tokio::spawn(async move {
                send_member_list(&channel, &dispatcher, &local, &config, &target).await;
            });
        }

        if newly_added {
            // Tell the rest of the group about the newcomer.
            let messenger = Arc::clone(&self.messenger);
            let options = self
                .messenger
                .default_options()
                .membership(true)
                .synchronized(false);
            let domain = table.domain().to_vec();
            let joiner = joiner.clone();
            tokio::spawn(async move {
                let payload = Payload::MemberJoined {
                    member: WirePeer::from(&joiner),
                };
                if let Err(err) = messenger
                    .fan_out(payload, &domain, options, Some(&joiner))
                    .await
                {
                    warn!(error = %err, "could not announce new member to the group");
                }
            });
        }
    }

    async fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Multicast discovery: the local peer announces itself on a multicast group
/// and learns about others from their announcements; silent peers are
/// dropped after the configured silence threshold.
pub struct MulticastScheme {
    dispatcher: Arc<MembershipEventDispatcher>,
    local: Peer,
    config: ClusterConfig,
    last_seen: Arc<DashMap<(String, u16), u64>>,
    shutdown: Arc<AtomicBool>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MulticastScheme {
    pub fn new(
        dispatcher: Arc<MembershipEventDispatcher>,
        local: Peer,
        config: ClusterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            local,
            config,
            last_seen: Arc::new(DashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn heartbeat_envelope(&self) -> Envelope {
        Envelope::new(
            self.local.domain().to_vec(),
            flags::MEMBERSHIP_MSG,
            Payload::Heartbeat {
                peer: WirePeer::from(&self.local),
            },
        )
    }
}

#[async_trait]
impl MembershipScheme for MulticastScheme {
    async fn init(&self) -> Result<()> {
        let group = self.config.multicast.group;
        let port = self.config.multicast.port;

        let send_socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        send_socket.set_multicast_loop_v4(true)?;

        let recv_socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        recv_socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        info!(group = %group, port, "joined multicast discovery group");

        let mut tasks = self.tasks.lock();

        // Announce the local peer at the configured frequency.
        let local_endpoint = self.local.endpoint();
        let mut announcement = self.heartbeat_envelope();
        announcement.sender = local_endpoint.clone();
        let frame = rkyv::to_bytes::<rkyv::rancor::Error>(&announcement)?.to_vec();
        let frequency = self.config.multicast.frequency;
        let shutdown = Arc::clone(&self.shutdown);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(frequency);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                if let Err(err) = send_socket.send_to(&frame, (group, port)).await {
                    warn!(error = %err, "failed to send multicast announcement");
                }
            }
        }));

        // Receive announcements from the rest of the group.
        let dispatcher = Arc::clone(&self.dispatcher);
        let last_seen = Arc::clone(&self.last_seen);
        let shutdown = Arc::clone(&self.shutdown);
        let local = self.local.clone();
        tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (len, _from) = match recv_socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        warn!(error = %err, "multicast receive failed");
                        continue;
                    }
                };
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let envelope = match wire::decode_body(&buf[..len]) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        debug!(error = %err, "ignoring undecodable multicast datagram");
                        continue;
                    }
                };
                let Payload::Heartbeat { peer } = envelope.payload else {
                    continue;
                };
                let peer = peer.into_peer();
                if peer == local {
                    continue;
                }
                last_seen.insert(
                    (peer.host().to_string(), peer.port()),
                    current_timestamp_ms(),
                );
                // Duplicate joins and foreign domains are filtered downstream.
                dispatcher.member_joined(peer);
            }
        }));

        // Expire peers that have gone silent.
        let dispatcher = Arc::clone(&self.dispatcher);
        let last_seen = Arc::clone(&self.last_seen);
        let shutdown = Arc::clone(&self.shutdown);
        let drop_time = self.config.multicast.drop_time;
        let sweep = self.config.multicast.frequency;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(sweep);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let now = current_timestamp_ms();
                let expired: Vec<(String, u16)> = last_seen
                    .iter()
                    .filter(|entry| {
                        now.saturating_sub(*entry.value()) > drop_time.as_millis() as u64
                    })
                    .map(|entry| entry.key().clone())
                    .collect();
                for (host, port) in expired {
                    last_seen.remove(&(host.clone(), port));
                    if let Some(peer) = dispatcher.table().get(&host, port) {
                        info!(peer = %peer, "member silent past drop time, removing");
                        dispatcher.member_left(&peer);
                    }
                }
            }
        }));

        Ok(())
    }

    /// Membership arrives asynchronously through the announcement tasks.
    async fn join_group(&self) -> Result<()> {
        Ok(())
    }

    async fn process_join(&self, joiner: &Peer) {
        self.dispatcher.member_joined(joiner.clone());
    }

    async fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
