use groupcast::{
    ClusterAgent, ClusterConfig, CommandHandler, MemberAddress, SchemeKind,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

struct Recorder {
    received: Mutex<Vec<Vec<u8>>>,
    reply: Vec<u8>,
}

impl Recorder {
    fn new(reply: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            reply: reply.to_vec(),
        })
    }

    fn commands(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

impl CommandHandler for Recorder {
    fn handle(
        &self,
        command: &[u8],
    ) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error + Send + Sync>> {
        self.received.lock().unwrap().push(command.to_vec());
        Ok(Some(self.reply.clone()))
    }
}

fn wka_config(domain: &str, wka: Vec<MemberAddress>, port: Option<u16>) -> ClusterConfig {
    ClusterConfig {
        domain: domain.to_string(),
        scheme: SchemeKind::Wka,
        wka_members: wka,
        local_host: Some("127.0.0.1".to_string()),
        local_port: port.or(Some(0)),
        connect_timeout: Duration::from_millis(300),
        rpc_timeout: Duration::from_secs(5),
        max_retries: 2,
        ..Default::default()
    }
}

fn address_of(agent: &ClusterAgent) -> MemberAddress {
    let peer = agent.local_peer();
    MemberAddress {
        host: peer.host().to_string(),
        port: peer.port(),
    }
}

#[tokio::test]
async fn test_two_node_wka_cluster_forms_and_exchanges_messages(
) -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().ok();

    let handler1 = Recorder::new(b"from-node1");
    let node1 = ClusterAgent::init(wka_config("grp1", vec![], None), handler1.clone()).await?;
    assert!(node1.is_initialized());
    assert_eq!(node1.alive_member_count(), 0);

    let handler2 = Recorder::new(b"from-node2");
    let node2 = ClusterAgent::init(
        wka_config("grp1", vec![address_of(&node1)], None),
        handler2.clone(),
    )
    .await?;

    // Give the join announcement a moment to settle on both sides.
    sleep(Duration::from_millis(500)).await;

    assert_eq!(node1.members(), vec![node2.local_peer()]);
    assert_eq!(node2.members(), vec![node1.local_peer()]);

    // RPC-style send returns the responders' payloads.
    let responses = node1.send_message(b"sync-config", true).await?;
    assert_eq!(responses, vec![b"from-node2".to_vec()]);
    assert_eq!(handler2.commands(), vec![b"sync-config".to_vec()]);

    let responses = node2.send_message(b"sync-state", true).await?;
    assert_eq!(responses, vec![b"from-node1".to_vec()]);
    assert_eq!(handler1.commands(), vec![b"sync-state".to_vec()]);

    // Exactly one member of the domain holds the coordinator role.
    assert!(node1.is_coordinator() ^ node2.is_coordinator());

    node2.shutdown().await;
    sleep(Duration::from_millis(500)).await;
    assert!(node1.members().is_empty());
    assert!(node1.is_coordinator());

    node1.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_fire_and_forget_send_returns_no_responses(
) -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().ok();

    let handler1 = Recorder::new(b"r1");
    let node1 = ClusterAgent::init(wka_config("grp2", vec![], None), handler1).await?;

    let handler2 = Recorder::new(b"r2");
    let node2 = ClusterAgent::init(
        wka_config("grp2", vec![address_of(&node1)], None),
        handler2.clone(),
    )
    .await?;
    sleep(Duration::from_millis(300)).await;

    let responses = node1.send_message(b"notify", false).await?;
    assert!(responses.is_empty());

    // The command still arrives.
    let mut delivered = false;
    for _ in 0..20 {
        sleep(Duration::from_millis(100)).await;
        if handler2.commands() == vec![b"notify".to_vec()] {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "fire-and-forget command should reach the member");

    node2.shutdown().await;
    node1.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_domain_isolation_between_clusters() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().ok();

    let node1 = ClusterAgent::init(wka_config("grp-a", vec![], None), Recorder::new(b"a")).await?;

    // A node from another domain pointed at node1 must not enter grp-a.
    let stranger = ClusterAgent::init(
        wka_config("grp-b", vec![address_of(&node1)], None),
        Recorder::new(b"b"),
    )
    .await?;

    sleep(Duration::from_millis(500)).await;
    assert!(node1.members().is_empty());

    stranger.shutdown().await;
    node1.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_third_node_learns_full_membership() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().ok();

    let node1 = ClusterAgent::init(wka_config("grp3", vec![], None), Recorder::new(b"1")).await?;
    let node2 = ClusterAgent::init(
        wka_config("grp3", vec![address_of(&node1)], None),
        Recorder::new(b"2"),
    )
    .await?;
    let node3 = ClusterAgent::init(
        wka_config("grp3", vec![address_of(&node1)], None),
        Recorder::new(b"3"),
    )
    .await?;

    // node3 joined through node1; the member list plus the MEMBER_JOINED
    // announcement give every node the full view.
    let mut complete = false;
    for _ in 0..50 {
        sleep(Duration::from_millis(100)).await;
        if node1.alive_member_count() == 2
            && node2.alive_member_count() == 2
            && node3.alive_member_count() == 2
        {
            complete = true;
            break;
        }
    }
    assert!(complete, "all three nodes should see the other two");

    let responses = node3.send_message(b"hello", true).await?;
    assert_eq!(responses.len(), 2);

    node3.shutdown().await;
    node2.shutdown().await;
    node1.shutdown().await;
    Ok(())
}
