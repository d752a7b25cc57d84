use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap::{MembershipScheme, MulticastScheme, WkaScheme};
use crate::channel::{ChannelHandler, NodeChannel};
use crate::config::{ClusterConfig, SchemeKind};
use crate::dispatcher::{MembershipEventDispatcher, MembershipListener};
use crate::election::{CoordinatorElection, ElectionTransition};
use crate::membership::{
    GroupManagementAgent, MembershipTable, SubDomainGate, TableRegistry,
};
use crate::messenger::GroupMessenger;
use crate::peer::{Peer, PeerProperties};
use crate::suppressor::DuplicateSuppressor;
use crate::wire::{Envelope, Payload, WirePeer};
use crate::{ClusterError, Result};

/// Sub-domain used when a group management agent is registered without one
pub const DEFAULT_SUB_DOMAIN: &str = "__default";

/// Attempts made when fetching initialization state from a neighbour
const INIT_FETCH_RETRIES: usize = 5;

/// Backoff between initialization fetch attempts
const INIT_FETCH_BACKOFF: Duration = Duration::from_secs(2);

/// Applies received commands to local state. The clustering layer never
/// interprets command contents; it only transports, dedupes, orders and
/// acknowledges them.
pub trait CommandHandler: Send + Sync {
    /// Execute a command, optionally producing a response payload for the
    /// sender.
    fn handle(
        &self,
        command: &[u8],
    ) -> std::result::Result<Option<Vec<u8>>, Box<dyn std::error::Error + Send + Sync>>;
}

struct AgentInner {
    config: ClusterConfig,
    local: Peer,
    channel: Arc<NodeChannel>,
    tables: Arc<TableRegistry>,
    primary: Arc<MembershipTable>,
    dispatcher: Arc<MembershipEventDispatcher>,
    election: Arc<CoordinatorElection>,
    messenger: Arc<GroupMessenger>,
    suppressor: Option<Arc<DuplicateSuppressor>>,
    scheme: Arc<dyn MembershipScheme>,
    handler: Arc<dyn CommandHandler>,
    group_agents: RwLock<HashMap<String, Arc<SubDomainGate>>>,
    initialized: AtomicBool,
}

impl AgentInner {
    /// Run a command through the application handler. A panic here means
    /// local state may be inconsistent; it is logged at the highest severity
    /// and re-raised rather than swallowed.
    fn execute_command(&self, command: &[u8]) -> Result<Option<Vec<u8>>> {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.handle(command)));
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => Err(ClusterError::CommandFailed(err.to_string())),
            Err(panic) => {
                error!("catastrophic failure executing command, local state may be inconsistent");
                resume_unwind(panic);
            }
        }
    }

    fn route_join(&self, peer: Peer) {
        if crate::domains_match(peer.domain(), self.primary.domain()) {
            self.dispatcher.member_joined(peer);
        } else if let Some(table) = self.tables.get(peer.domain()) {
            table.add(peer);
        } else {
            debug!(peer = %peer, "ignoring member of unmanaged domain");
        }
    }

    fn route_leave(&self, peer: &Peer) {
        if crate::domains_match(peer.domain(), self.primary.domain()) {
            self.dispatcher.member_left(peer);
        } else if let Some(table) = self.tables.get(peer.domain()) {
            table.remove(peer);
        }
    }
}

/// The main clustering agent: wires the bootstrap scheme, membership event
/// dispatcher, coordinator election and group messenger together over one
/// node channel, and exposes message sending to external command producers.
pub struct ClusterAgent {
    inner: Arc<AgentInner>,
}

impl ClusterAgent {
    /// Initialize the cluster node and join its domain.
    ///
    /// Blocks until the join completes; under the WKA scheme that includes
    /// waiting until at least one well-known member is reachable.
    #[instrument(skip(config, handler), fields(domain = %config.domain))]
    pub async fn init(config: ClusterConfig, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        info!("initializing cluster agent");
        let domain = config.domain_bytes();

        let suppressor = if config.at_most_once {
            let suppressor = Arc::new(DuplicateSuppressor::new(
                config.suppressor_ttl,
                config.sweep_max_removals,
            ));
            suppressor.start_sweeper(config.sweep_interval);
            Some(suppressor)
        } else {
            None
        };

        let host = config
            .local_host
            .clone()
            .unwrap_or_else(detect_local_host);
        if host.starts_with("127.0.") {
            warn!(
                host = %host,
                "advertising a loopback address; remote members will not be able to connect"
            );
        }

        let channel = NodeChannel::bind(&host, &config, suppressor.clone()).await?;

        let mut properties: PeerProperties = config
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        properties.insert("active", if config.is_active { "true" } else { "false" });
        let local = Peer::new(host, channel.bind_addr.port(), domain.clone())
            .with_properties(properties);
        info!(local = %local, "local member configured");

        let tables = Arc::new(TableRegistry::new());
        let primary = tables.get_or_create(&domain);
        let dispatcher = Arc::new(MembershipEventDispatcher::new(primary.clone()));
        let election = Arc::new(CoordinatorElection::new(local.clone()));
        let messenger = Arc::new(GroupMessenger::new(
            channel.clone(),
            tables.clone(),
            config.clone(),
        ));

        let driver = Arc::new(ElectionDriver {
            election: election.clone(),
            messenger: messenger.clone(),
            table: primary.clone(),
            local: local.clone(),
        });
        dispatcher.add_listener(driver.clone());

        let scheme: Arc<dyn MembershipScheme> = match config.scheme {
            SchemeKind::Wka => WkaScheme::new(
                channel.clone(),
                dispatcher.clone(),
                messenger.clone(),
                local.clone(),
                config.clone(),
            ),
            SchemeKind::Multicast => {
                MulticastScheme::new(dispatcher.clone(), local.clone(), config.clone())
            }
        };

        let inner = Arc::new(AgentInner {
            config,
            local,
            channel: channel.clone(),
            tables,
            primary,
            dispatcher,
            election,
            messenger,
            suppressor,
            scheme: scheme.clone(),
            handler,
            group_agents: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        });

        channel
            .set_handler(Arc::new(AgentHandler {
                inner: Arc::downgrade(&inner),
            }))
            .await;
        channel.start();

        scheme.init().await?;
        scheme.join_group().await?;

        // Seed the coordinator state before reporting ready.
        driver.reevaluate();

        inner.initialized.store(true, Ordering::Release);
        info!(
            members = inner.primary.len(),
            "cluster initialization completed"
        );
        Ok(Self { inner })
    }

    /// Send an opaque command to every member of the local domain.
    ///
    /// With `rpc` the call blocks until members acknowledge and returns their
    /// response payloads; without it the send is fire-and-forget and the list
    /// is empty. An uninitialized node returns an empty list rather than
    /// failing. Serialization failures propagate; an empty list always means
    /// "no confirmed responses", never partial silent success.
    pub async fn send_message(&self, command: &[u8], rpc: bool) -> Result<Vec<Vec<u8>>> {
        if !self.inner.initialized.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }
        let options = self
            .inner
            .messenger
            .default_options()
            .synchronized(rpc);
        let report = self
            .inner
            .messenger
            .send_to_all(command, self.inner.primary.domain(), options)
            .await?;
        Ok(report
            .responses
            .into_iter()
            .map(|(_, response)| response)
            .collect())
    }

    /// Fetch initialization state from a neighbour on a background task: the
    /// longest-lived member is asked first, then random members, with bounded
    /// retries and backoff. The first reply is handed to the command handler.
    pub fn initialize_from_group(&self, request: Vec<u8>) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut attempted: HashSet<String> = HashSet::new();
            attempted.insert(inner.channel.local_endpoint().to_string());

            for attempt in 0..INIT_FETCH_RETRIES {
                let members = inner.primary.all();
                if members.is_empty() {
                    return;
                }
                let member = if attempt == 0 {
                    inner.primary.longest_lived()
                } else {
                    inner.primary.random_member()
                };
                let Some(member) = member else { return };
                if attempted.contains(&member.endpoint()) {
                    continue;
                }

                info!(member = %member, "requesting initialization state");
                let envelope = Envelope::new(
                    inner.primary.domain().to_vec(),
                    0,
                    Payload::InitRequest {
                        request: request.clone(),
                    },
                );
                match inner
                    .channel
                    .request(&member.endpoint(), envelope, inner.config.rpc_timeout)
                    .await
                {
                    Ok(Some(reply)) => {
                        if let Payload::Response { response } = reply.payload {
                            if let Err(err) = inner.execute_command(&response) {
                                error!(error = %err, "initialization state could not be applied");
                            }
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!(member = %member, "no initialization reply yet");
                    }
                    Err(err) => {
                        warn!(
                            member = %member,
                            error = %err,
                            retry_secs = INIT_FETCH_BACKOFF.as_secs(),
                            "cannot get initialization state, will retry"
                        );
                        attempted.insert(member.endpoint());
                    }
                }
                tokio::time::sleep(INIT_FETCH_BACKOFF).await;
                if attempt + 1 >= inner.primary.len() {
                    break;
                }
            }
        })
    }

    /// Register a per-domain/sub-domain admission and tracking policy,
    /// creating the domain's sub-table when needed.
    pub fn add_group_management_agent(
        &self,
        agent: Arc<dyn GroupManagementAgent>,
        domain: &str,
        sub_domain: Option<&str>,
    ) {
        let sub_domain = sub_domain.unwrap_or(DEFAULT_SUB_DOMAIN);
        info!(domain, sub_domain, "managing group application domain");

        let gate = {
            let mut agents = self.inner.group_agents.write();
            agents
                .entry(domain.to_string())
                .or_insert_with(|| Arc::new(SubDomainGate::new(DEFAULT_SUB_DOMAIN)))
                .clone()
        };
        gate.register(sub_domain, agent);

        let table = self.inner.tables.get_or_create(domain.as_bytes());
        table.set_admission_gate(gate);
    }

    pub fn get_group_management_agent(
        &self,
        domain: &str,
        sub_domain: Option<&str>,
    ) -> Option<Arc<dyn GroupManagementAgent>> {
        let sub_domain = sub_domain.unwrap_or(DEFAULT_SUB_DOMAIN);
        self.inner
            .group_agents
            .read()
            .get(domain)
            .and_then(|gate| gate.get(sub_domain))
    }

    /// Domains with a registered group management agent.
    pub fn managed_domains(&self) -> Vec<String> {
        self.inner.group_agents.read().keys().cloned().collect()
    }

    pub fn is_coordinator(&self) -> bool {
        self.inner.election.is_coordinator()
    }

    /// The messenger this agent sends through, for callers that need
    /// per-peer delivery or explicit fault reports.
    pub fn messenger(&self) -> &GroupMessenger {
        &self.inner.messenger
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    pub fn local_peer(&self) -> Peer {
        self.inner.local.clone()
    }

    /// Snapshot of the local domain's live members.
    pub fn members(&self) -> Vec<Peer> {
        self.inner.primary.all()
    }

    pub fn alive_member_count(&self) -> usize {
        self.inner.primary.len()
    }

    /// Leave the group and release transport resources.
    pub async fn shutdown(&self) {
        info!(local = %self.inner.local, "shutting down cluster agent");
        self.inner.initialized.store(false, Ordering::Release);

        // Best-effort leave announcement so the group need not wait for
        // failure detection.
        let options = self
            .inner
            .messenger
            .default_options()
            .membership(true)
            .synchronized(false);
        let leave = Payload::Leave {
            leaver: WirePeer::from(&self.inner.local),
        };
        if let Err(err) = self
            .inner
            .messenger
            .fan_out(leave, self.inner.primary.domain(), options, None)
            .await
        {
            debug!(error = %err, "leave announcement failed");
        }

        self.inner.scheme.stop().await;
        if let Some(suppressor) = &self.inner.suppressor {
            suppressor.stop();
        }
        self.inner.channel.shutdown().await;
        self.inner.primary.clear();
        info!("cluster agent shutdown complete");
    }
}

/// Re-runs the election after every membership change and announces the
/// local claim when it wins.
struct ElectionDriver {
    election: Arc<CoordinatorElection>,
    messenger: Arc<GroupMessenger>,
    table: Arc<MembershipTable>,
    local: Peer,
}

impl ElectionDriver {
    fn reevaluate(&self) {
        if self.election.evaluate(&self.table.all()) == ElectionTransition::Won {
            let messenger = self.messenger.clone();
            let domain = self.table.domain().to_vec();
            let local = self.local.clone();
            tokio::spawn(async move {
                let options = messenger
                    .default_options()
                    .membership(true)
                    .synchronized(false);
                let payload = Payload::CoordinatorAnnounce {
                    coordinator: WirePeer::from(&local),
                };
                if let Err(err) = messenger.fan_out(payload, &domain, options, None).await {
                    warn!(error = %err, "failed to announce coordinator claim");
                }
            });
        }
    }
}

impl MembershipListener for ElectionDriver {
    fn member_joined(&self, _peer: &Peer) {
        self.reevaluate();
    }

    fn member_left(&self, _peer: &Peer) {
        self.reevaluate();
    }
}

/// Receives everything the channel delivers and routes it: membership
/// traffic to the scheme/dispatcher, commands to the application handler.
struct AgentHandler {
    inner: Weak<AgentInner>,
}

#[async_trait]
impl ChannelHandler for AgentHandler {
    async fn on_envelope(&self, envelope: Envelope) -> Result<Option<Payload>> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(None);
        };

        // Messages for domains this node does not manage are expected
        // multi-tenant noise, not faults.
        if inner.tables.get(&envelope.domain).is_none() {
            debug!(
                domain = %String::from_utf8_lossy(&envelope.domain),
                "ignoring message for foreign domain"
            );
            return Ok(None);
        }

        match envelope.payload {
            Payload::Join { joiner } => {
                let peer = joiner.into_peer();
                info!(peer = %peer, "received JOIN request");
                if crate::domains_match(peer.domain(), inner.primary.domain()) {
                    inner.scheme.process_join(&peer).await;
                } else {
                    // Application-domain joins go straight to that domain's
                    // sub-table, through its admission gate.
                    inner.route_join(peer.clone());
                }

                let table = inner
                    .tables
                    .get(&envelope.domain)
                    .unwrap_or_else(|| inner.primary.clone());
                let mut members: Vec<WirePeer> =
                    table.all().iter().map(WirePeer::from).collect();
                if crate::domains_match(table.domain(), inner.primary.domain()) {
                    // The local node itself is a member of the primary domain
                    // only.
                    members.push(WirePeer::from(&inner.local));
                }
                Ok(Some(Payload::MemberList { members }))
            }
            Payload::MemberList { members } => {
                for member in members {
                    let peer = member.into_peer();
                    if peer != inner.local {
                        inner.route_join(peer);
                    }
                }
                Ok(None)
            }
            Payload::MemberJoined { member } => {
                inner.route_join(member.into_peer());
                Ok(None)
            }
            Payload::Leave { leaver } => {
                inner.route_leave(&leaver.into_peer());
                Ok(None)
            }
            Payload::Heartbeat { peer } => {
                inner.route_join(peer.into_peer());
                Ok(None)
            }
            Payload::CoordinatorAnnounce { coordinator } => {
                inner.election.on_announcement(&coordinator.into_peer());
                Ok(None)
            }
            Payload::InitRequest { request } => {
                let reply = inner.execute_command(&request)?;
                Ok(Some(Payload::Response {
                    response: reply.unwrap_or_default(),
                }))
            }
            Payload::Command { command } => {
                let reply = inner.execute_command(&command)?;
                Ok(reply.map(|response| Payload::Response { response }))
            }
            Payload::Response { .. } | Payload::Ack => Ok(None),
        }
    }

    async fn on_peer_disconnected(&self, endpoint: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Some((host, port)) = endpoint.rsplit_once(':') else {
            return;
        };
        let Ok(port) = port.parse::<u16>() else {
            return;
        };
        if let Some(peer) = inner.primary.get(host, port) {
            info!(peer = %peer, "connection lost, treating member as disappeared");
            inner.dispatcher.member_left(&peer);
        }
    }
}

/// Pick the address remote members should dial: the source address of the
/// default route. No packets are sent.
fn detect_local_host() -> String {
    let detected = std::net::UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("8.8.8.8:53")?;
        socket.local_addr()
    });
    match detected {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}
