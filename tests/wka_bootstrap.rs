use groupcast::{ClusterAgent, ClusterConfig, CommandHandler, MemberAddress, SchemeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

struct NoopHandler;

impl CommandHandler for NoopHandler {
    fn handle(
        &self,
        _command: &[u8],
    ) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(None)
    }
}

fn wka_config(wka: Vec<MemberAddress>, port: Option<u16>) -> ClusterConfig {
    ClusterConfig {
        domain: "bootstrap-grp".to_string(),
        scheme: SchemeKind::Wka,
        wka_members: wka,
        local_host: Some("127.0.0.1".to_string()),
        local_port: port.or(Some(0)),
        connect_timeout: Duration::from_millis(200),
        probe_attempts: 1,
        wka_retry_interval: Duration::from_millis(500),
        rpc_timeout: Duration::from_secs(5),
        max_retries: 2,
        ..Default::default()
    }
}

/// Reserve a loopback port that is currently closed.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn test_init_blocks_until_a_wka_member_is_reachable(
) -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().ok();

    let port_a = closed_port();
    let port_b = closed_port();
    let wka = vec![
        MemberAddress {
            host: "127.0.0.1".to_string(),
            port: port_a,
        },
        MemberAddress {
            host: "127.0.0.1".to_string(),
            port: port_b,
        },
    ];

    let joiner = tokio::spawn(async move {
        ClusterAgent::init(wka_config(wka, None), Arc::new(NoopHandler)).await
    });

    // Both candidates are down: init must keep blocking.
    sleep(Duration::from_secs(2)).await;
    assert!(
        !joiner.is_finished(),
        "init must not return while every well-known member is unreachable"
    );

    // Bring one candidate up; the blocked node must now come through.
    let wka_node = ClusterAgent::init(wka_config(vec![], Some(port_a)), Arc::new(NoopHandler))
        .await?;

    let joined = tokio::time::timeout(Duration::from_secs(20), joiner).await???;
    assert!(joined.is_initialized());

    // Exactly the reachable candidate is in the live set.
    let members = joined.members();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].port(), port_a);

    joined.shutdown().await;
    wka_node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_first_node_with_no_candidates_starts_alone(
) -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().ok();

    let agent = ClusterAgent::init(wka_config(vec![], None), Arc::new(NoopHandler)).await?;
    assert!(agent.is_initialized());
    assert_eq!(agent.alive_member_count(), 0);
    assert!(agent.is_coordinator());

    agent.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_own_address_in_wka_list_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().ok();

    let port = closed_port();
    let own = vec![MemberAddress {
        host: "127.0.0.1".to_string(),
        port,
    }];

    // The only candidate is the node itself: it must start without blocking.
    let agent = ClusterAgent::init(wka_config(own, Some(port)), Arc::new(NoopHandler)).await?;
    assert!(agent.is_initialized());
    assert_eq!(agent.alive_member_count(), 0);

    agent.shutdown().await;
    Ok(())
}
