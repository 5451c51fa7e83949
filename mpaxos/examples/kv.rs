//! Three peers on loopback agreeing on a short sequence of KV commands.

use std::time::Duration;

use log::info;
use mpaxos::{config::Configure, Fate, Peer};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum KvOp {
    Put,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvCommand {
    key: String,
    value: Option<String>,
    op: KvOp,
}

#[tokio::main]
async fn main() -> Result<(), mpaxos::error::RpcError> {
    env_logger::init();

    let peer = vec![
        "127.0.0.1:9600".to_owned(),
        "127.0.0.1:9601".to_owned(),
        "127.0.0.1:9602".to_owned(),
    ];

    let mut peers = Vec::with_capacity(3);
    for c in (0..3).map(|id| Configure::new(3, peer.to_vec(), id)) {
        peers.push(Peer::<KvCommand>::new(c).await?);
    }

    for (seq, key) in ["alpha", "beta", "gamma"].iter().enumerate() {
        let cmd = KvCommand {
            key: (*key).to_owned(),
            value: Some(format!("value-{seq}")),
            op: KvOp::Put,
        };
        peers[seq % 3].start(seq as i64, cmd).await;
    }

    // poll until every peer reports every slot decided
    for seq in 0..3 {
        for p in &peers {
            loop {
                let (fate, value) = p.status(seq).await;
                if fate == Fate::Decided {
                    info!("peer {} slot {} -> {:?}", p.me(), seq, value);
                    break;
                }
                sleep(Duration::from_millis(20)).await;
            }
        }
    }

    // release the old slots; the marks only travel on outbound decides,
    // so let every peer drive one more slot before reading the horizon
    for p in &peers {
        p.done(2).await;
    }
    for (seq, p) in (3..6).zip(&peers) {
        p.start(
            seq,
            KvCommand {
                key: "delta".to_owned(),
                value: None,
                op: KvOp::Delete,
            },
        )
        .await;
    }
    for seq in 3..6 {
        for p in &peers {
            loop {
                let (fate, _) = p.status(seq).await;
                if fate == Fate::Decided {
                    break;
                }
                sleep(Duration::from_millis(20)).await;
            }
        }
    }
    info!("peer 0 min is now {}", peers[0].min().await);

    for p in &peers {
        p.kill();
    }
    Ok(())
}
