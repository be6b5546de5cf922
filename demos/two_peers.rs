//! Two in-process peers: handshake, reliable delivery, window drain.

use std::time::Duration;

use tracing::{info, Level};

use roomnet::test_util::{link, TestNode};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    init_logging();

    let alice = TestNode::new(0xa11ce).await;
    let bob = TestNode::new(0xb0b).await;
    link(&alice, &bob).await;

    let connection = alice.connections.connect(bob.id).await?;
    info!("handshake complete");

    for i in 0u32..10 {
        connection.send(format!("message {}", i).as_bytes()).await?;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    for message in bob.app.messages().await {
        info!("bob received: {}", String::from_utf8_lossy(&message));
    }
    info!("pending slots on alice's side: {}", connection.num_pending().await);

    Ok(())
}
