//! End-to-end agreement scenarios over loopback TCP.

use std::time::{Duration, Instant};

use mpaxos::{config::Configure, Fate, Peer};
use tokio::time::sleep;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Pick `n` endpoints the OS considers free right now. The listener is
/// dropped again so a peer can bind the address later, which also lets a
/// test leave some group members unreachable until it starts them.
fn reserve_endpoints(n: usize) -> Vec<String> {
    (0..n)
        .map(|_| {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            drop(listener);
            addr
        })
        .collect()
}

async fn spawn_peer(endpoints: &[String], index: usize) -> Peer<String> {
    Peer::new(Configure::new(endpoints.len(), endpoints.to_vec(), index))
        .await
        .unwrap()
}

async fn spawn_group(endpoints: &[String]) -> Vec<Peer<String>> {
    let mut peers = Vec::with_capacity(endpoints.len());
    for i in 0..endpoints.len() {
        peers.push(spawn_peer(endpoints, i).await);
    }
    peers
}

async fn wait_decided(peer: &Peer<String>, seq: i64, budget: Duration) -> String {
    let deadline = Instant::now() + budget;
    loop {
        let (fate, value) = peer.status(seq).await;
        if fate == Fate::Decided {
            return value.unwrap();
        }
        assert!(
            Instant::now() < deadline,
            "peer {} seq {} still {:?} after {:?}",
            peer.me(),
            seq,
            fate,
            budget
        );
        sleep(Duration::from_millis(25)).await;
    }
}

/// Wait until every peer reports the slot decided, and check they all
/// report the same value.
async fn wait_agreement(peers: &[Peer<String>], seq: i64) -> String {
    let mut values = Vec::with_capacity(peers.len());
    for p in peers {
        values.push(wait_decided(p, seq, Duration::from_secs(10)).await);
    }
    for v in &values {
        assert_eq!(v, &values[0], "peers decided different values for seq {seq}");
    }
    values.remove(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_proposer_three_peers() {
    init_log();
    let endpoints = reserve_endpoints(3);
    let peers = spawn_group(&endpoints).await;

    peers[0].start(0, "x".to_owned()).await;
    let chosen = wait_agreement(&peers, 0).await;
    assert_eq!(chosen, "x");

    for p in &peers {
        assert_eq!(p.max().await, 0);
    }

    for p in &peers {
        p.kill();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_proposers_pick_one_value() {
    init_log();
    let endpoints = reserve_endpoints(3);
    let peers = spawn_group(&endpoints).await;

    peers[0].start(0, "a".to_owned()).await;
    peers[1].start(0, "b".to_owned()).await;

    let chosen = wait_agreement(&peers, 0).await;
    assert!(chosen == "a" || chosen == "b", "chose {chosen:?}");

    for p in &peers {
        p.kill();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_slot_is_independent() {
    init_log();
    let endpoints = reserve_endpoints(3);
    let peers = spawn_group(&endpoints).await;

    // different proposers on different slots, all in flight at once
    peers[0].start(0, "slot0".to_owned()).await;
    peers[1].start(1, "slot1".to_owned()).await;
    peers[2].start(2, "slot2".to_owned()).await;

    assert_eq!(wait_agreement(&peers, 0).await, "slot0");
    assert_eq!(wait_agreement(&peers, 1).await, "slot1");
    assert_eq!(wait_agreement(&peers, 2).await, "slot2");

    for p in &peers {
        assert_eq!(p.max().await, 2);
    }

    for p in &peers {
        p.kill();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_minority_catches_up() {
    init_log();
    let endpoints = reserve_endpoints(5);

    // only the majority side of the "partition" is up
    let majority = vec![
        spawn_peer(&endpoints, 0).await,
        spawn_peer(&endpoints, 1).await,
        spawn_peer(&endpoints, 2).await,
    ];

    majority[0].start(0, "p".to_owned()).await;
    let chosen = wait_agreement(&majority, 0).await;
    assert_eq!(chosen, "p");

    // partition heals: the minority comes up knowing nothing
    let late3 = spawn_peer(&endpoints, 3).await;
    let late4 = spawn_peer(&endpoints, 4).await;
    assert_eq!(late3.status(0).await.0, Fate::Pending);

    // a late proposer with its own value must converge to the value
    // already chosen, not the one it supplied
    late3.start(0, "q".to_owned()).await;
    assert_eq!(wait_decided(&late3, 0, Duration::from_secs(10)).await, "p");
    assert_eq!(wait_decided(&late4, 0, Duration::from_secs(10)).await, "p");

    for p in majority.iter().chain([&late3, &late4]) {
        p.kill();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn done_advances_the_forget_horizon() {
    init_log();
    let endpoints = reserve_endpoints(3);
    let peers = spawn_group(&endpoints).await;

    for seq in 0..10 {
        peers[(seq % 3) as usize]
            .start(seq, format!("v{seq}"))
            .await;
        wait_agreement(&peers, seq).await;
    }

    for p in &peers {
        p.done(9).await;
    }
    // done marks only travel on outbound decides, so every peer drives
    // one more slot before the horizon can move anywhere
    for (seq, p) in (10..13).zip(&peers) {
        p.start(seq, "filler".to_owned()).await;
    }
    for seq in 10..13 {
        wait_agreement(&peers, seq).await;
    }

    for p in &peers {
        assert_eq!(p.min().await, 10);
        assert_eq!(p.status(5).await.0, Fate::Forgotten);
        assert_eq!(p.status(13).await.0, Fate::Pending);
    }

    for p in &peers {
        p.kill();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn held_back_done_freezes_the_horizon() {
    init_log();
    let endpoints = reserve_endpoints(3);
    let peers = spawn_group(&endpoints).await;

    for seq in 0..4 {
        peers[(seq % 3) as usize]
            .start(seq, format!("v{seq}"))
            .await;
        wait_agreement(&peers, seq).await;
    }

    // peer 2 never reports done
    peers[0].done(3).await;
    peers[1].done(3).await;
    for (seq, p) in (4..6).zip(&peers) {
        p.start(seq, "filler".to_owned()).await;
    }
    for seq in 4..6 {
        wait_agreement(&peers, seq).await;
    }

    for p in &peers {
        assert_eq!(p.min().await, 0);
        // nothing was pruned
        assert_eq!(p.status(0).await.0, Fate::Decided);
    }

    for p in &peers {
        p.kill();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agreement_survives_lossy_links() {
    init_log();
    let endpoints = reserve_endpoints(3);
    let peers = spawn_group(&endpoints).await;
    for p in &peers {
        p.set_unreliable(true);
    }

    peers[0].start(0, "v".to_owned()).await;

    // the decide broadcast itself may be partly lost, so only a majority
    // is guaranteed to observe the decision; keep re-proposing so a fully
    // lost broadcast gets another chance
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut round = 0usize;
    loop {
        let mut decided = 0;
        for p in &peers {
            let (fate, value) = p.status(0).await;
            if fate == Fate::Decided {
                assert_eq!(value.as_deref(), Some("v"));
                decided += 1;
            }
        }
        if decided >= 2 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "no majority decided under lossy links"
        );
        round += 1;
        if round % 40 == 0 {
            peers[round / 40 % 3].start(0, "v".to_owned()).await;
        }
        sleep(Duration::from_millis(50)).await;
    }

    for p in &peers {
        p.kill();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_start_below_the_horizon_is_a_no_op() {
    init_log();
    let endpoints = reserve_endpoints(3);
    let peers = spawn_group(&endpoints).await;

    for seq in 0..3 {
        peers[(seq % 3) as usize]
            .start(seq, format!("v{seq}"))
            .await;
        wait_agreement(&peers, seq).await;
    }
    for p in &peers {
        p.done(2).await;
    }
    for (seq, p) in (3..6).zip(&peers) {
        p.start(seq, "filler".to_owned()).await;
    }
    for seq in 3..6 {
        wait_agreement(&peers, seq).await;
    }
    for p in &peers {
        assert_eq!(p.min().await, 3);
    }

    // the slot is permanently settled; proposing there must do nothing
    peers[0].start(1, "zombie".to_owned()).await;
    sleep(Duration::from_millis(300)).await;
    for p in &peers {
        assert_eq!(p.status(1).await.0, Fate::Forgotten);
        assert_eq!(p.max().await, 5);
    }

    for p in &peers {
        p.kill();
    }
}
