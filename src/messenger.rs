use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::channel::NodeChannel;
use crate::config::ClusterConfig;
use crate::membership::TableRegistry;
use crate::peer::Peer;
use crate::wire::{self, flags, Envelope, Payload};
use crate::{ClusterError, Result};

/// Delivery semantics for one send
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Block until every target acknowledges
    pub synchronized: bool,
    /// Preserve sender-relative ordering within the domain
    pub preserve_order: bool,
    /// Attach at-most-once semantics so receivers can dedupe
    pub at_most_once: bool,
    /// Mark as membership traffic rather than application data
    pub membership: bool,
    /// Acknowledgment timeout for synchronized sends
    pub timeout: Duration,
}

impl SendOptions {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            synchronized: config.synchronize_all,
            preserve_order: config.preserve_order,
            at_most_once: config.at_most_once,
            membership: false,
            timeout: config.rpc_timeout,
        }
    }

    pub fn synchronized(mut self, synchronized: bool) -> Self {
        self.synchronized = synchronized;
        self
    }

    pub fn membership(mut self, membership: bool) -> Self {
        self.membership = membership;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn flags(&self) -> u32 {
        let mut options = 0;
        if self.at_most_once {
            options |= flags::AT_MOST_ONCE;
        }
        if self.preserve_order {
            options |= flags::PRESERVE_ORDER;
        }
        if self.membership {
            options |= flags::MEMBERSHIP_MSG;
        }
        if self.synchronized {
            options |= flags::SYNC_ACK;
        }
        options
    }
}

/// A member that failed to receive or acknowledge a send, with the cause
#[derive(Debug)]
pub struct FaultyMember {
    pub peer: Peer,
    pub cause: ClusterError,
}

/// Outcome of a multi-target send. A partial failure never looks like full
/// success: the faulty subset is reported explicitly, per peer.
#[derive(Debug, Default)]
pub struct SendReport {
    /// Targets the command was delivered to (acknowledged, for synchronized
    /// sends)
    pub delivered: Vec<Peer>,
    /// Response payloads from members that answered with data
    pub responses: Vec<(Peer, Vec<u8>)>,
    /// Members that failed to receive or acknowledge, with causes
    pub faulty: Vec<FaultyMember>,
}

impl SendReport {
    pub fn all_delivered(&self) -> bool {
        self.faulty.is_empty()
    }
}

/// Sends commands to one, many, or all members of a domain with configurable
/// delivery semantics, retrying transient failures and reporting the faulty
/// subset of a fan-out.
pub struct GroupMessenger {
    channel: Arc<NodeChannel>,
    tables: Arc<TableRegistry>,
    config: ClusterConfig,
}

impl GroupMessenger {
    pub fn new(channel: Arc<NodeChannel>, tables: Arc<TableRegistry>, config: ClusterConfig) -> Self {
        Self {
            channel,
            tables,
            config,
        }
    }

    pub fn default_options(&self) -> SendOptions {
        SendOptions::from_config(&self.config)
    }

    /// Send an opaque command to every live member of `domain`.
    ///
    /// An unknown or empty domain is a no-op. Serialization failure surfaces
    /// as a hard error before anything is sent; network failures to a subset
    /// of targets are reported in the result without blocking delivery to the
    /// rest.
    pub async fn send_to_all(
        &self,
        command: &[u8],
        domain: &[u8],
        options: SendOptions,
    ) -> Result<SendReport> {
        self.fan_out(
            Payload::Command {
                command: command.to_vec(),
            },
            domain,
            options,
            None,
        )
        .await
    }

    /// Fan any payload out to the live members of `domain`, optionally
    /// excluding one member (used when announcing that member itself).
    pub(crate) async fn fan_out(
        &self,
        payload: Payload,
        domain: &[u8],
        options: SendOptions,
        exclude: Option<&Peer>,
    ) -> Result<SendReport> {
        let members: Vec<Peer> = match self.tables.get(domain) {
            Some(table) => table
                .all()
                .into_iter()
                .filter(|peer| Some(peer) != exclude)
                .collect(),
            None => Vec::new(),
        };
        if members.is_empty() {
            debug!(
                domain = %String::from_utf8_lossy(domain),
                "no members in domain, nothing to send"
            );
            return Ok(SendReport::default());
        }

        let mut envelope = Envelope::new(domain.to_vec(), options.flags(), payload);
        if options.preserve_order {
            // One sequence shared by every target keeps the sender order
            // identical across the whole fan-out.
            envelope.sequence = self.channel.next_sequence(domain);
        }
        // Fail on an unencodable payload before touching any member.
        wire::encode_frame(&envelope, self.config.max_message_size)?;

        let mut tasks = Vec::with_capacity(members.len());
        for peer in members {
            let channel = Arc::clone(&self.channel);
            let envelope = envelope.clone();
            let timeout = options.timeout;
            let synchronized = options.synchronized;
            tasks.push(tokio::spawn(async move {
                let outcome = if synchronized {
                    match channel.request(&peer.endpoint(), envelope, timeout).await {
                        Ok(Some(reply)) => Ok(match reply.payload {
                            Payload::Response { response } => Some(response),
                            _ => None,
                        }),
                        Ok(None) => Err(ClusterError::Timeout),
                        Err(err) => Err(err),
                    }
                } else {
                    channel
                        .send_to_endpoint(&peer.endpoint(), envelope)
                        .await
                        .map(|()| None)
                };
                (peer, outcome)
            }));
        }

        let mut report = SendReport::default();
        for task in tasks {
            match task.await {
                Ok((peer, Ok(response))) => {
                    if let Some(response) = response {
                        report.responses.push((peer.clone(), response));
                    }
                    report.delivered.push(peer);
                }
                Ok((peer, Err(cause))) => {
                    warn!(peer = %peer, error = %cause, "failed to deliver to member");
                    report.faulty.push(FaultyMember { peer, cause });
                }
                Err(err) => {
                    warn!(error = %err, "send task panicked");
                }
            }
        }

        debug!(
            domain = %String::from_utf8_lossy(domain),
            delivered = report.delivered.len(),
            faulty = report.faulty.len(),
            "fan-out completed"
        );
        Ok(report)
    }

    /// Point-to-point delivery with acknowledgment, used for directed
    /// administrative commands. `Ok(None)` means the peer did not answer in
    /// time; an `Ack` without data comes back as an empty payload.
    pub async fn send_to_one(
        &self,
        command: &[u8],
        peer: &Peer,
        options: SendOptions,
    ) -> Result<Option<Vec<u8>>> {
        let envelope = Envelope::new(
            peer.domain().to_vec(),
            options.flags() | flags::SYNC_ACK,
            Payload::Command {
                command: command.to_vec(),
            },
        );
        let reply = self
            .channel
            .request(&peer.endpoint(), envelope, options.timeout)
            .await?;
        Ok(reply.map(|reply| match reply.payload {
            Payload::Response { response } => response,
            _ => Vec::new(),
        }))
    }

    /// Loop a command back to the local node through the same delivery
    /// pipeline remote messages take.
    pub async fn send_to_self(&self, command: &[u8], domain: &[u8], options: SendOptions) {
        let envelope = Envelope::new(
            domain.to_vec(),
            options.flags(),
            Payload::Command {
                command: command.to_vec(),
            },
        );
        self.channel.deliver_local(envelope).await;
    }
}
