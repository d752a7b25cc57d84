use groupcast::{ClusterAgent, ClusterConfig, CommandHandler, MemberAddress, SchemeKind};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

struct OrderedRecorder {
    received: Mutex<Vec<Vec<u8>>>,
}

impl CommandHandler for OrderedRecorder {
    fn handle(
        &self,
        command: &[u8],
    ) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error + Send + Sync>> {
        self.received.lock().unwrap().push(command.to_vec());
        Ok(None)
    }
}

fn config(wka: Vec<MemberAddress>) -> ClusterConfig {
    ClusterConfig {
        domain: "ordered-grp".to_string(),
        scheme: SchemeKind::Wka,
        wka_members: wka,
        local_host: Some("127.0.0.1".to_string()),
        local_port: Some(0),
        preserve_order: true,
        at_most_once: true,
        connect_timeout: Duration::from_millis(300),
        rpc_timeout: Duration::from_secs(5),
        max_retries: 2,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_sender_order_is_preserved_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().ok();

    let recorder1 = Arc::new(OrderedRecorder {
        received: Mutex::new(Vec::new()),
    });
    let node1 = ClusterAgent::init(config(vec![]), recorder1).await?;

    let recorder2 = Arc::new(OrderedRecorder {
        received: Mutex::new(Vec::new()),
    });
    let peer1 = node1.local_peer();
    let node2 = ClusterAgent::init(
        config(vec![MemberAddress {
            host: peer1.host().to_string(),
            port: peer1.port(),
        }]),
        recorder2.clone(),
    )
    .await?;
    sleep(Duration::from_millis(300)).await;

    let sent: Vec<Vec<u8>> = (0u32..25)
        .map(|i| format!("command-{i:03}").into_bytes())
        .collect();
    for command in &sent {
        node1.send_message(command, false).await?;
    }

    let mut received = Vec::new();
    for _ in 0..50 {
        sleep(Duration::from_millis(100)).await;
        received = recorder2.received.lock().unwrap().clone();
        if received.len() == sent.len() {
            break;
        }
    }

    // Every command arrives exactly once, in send order.
    assert_eq!(received, sent);

    node2.shutdown().await;
    node1.shutdown().await;
    Ok(())
}
