//! Fresh networks set up by a DKG and producing rounds

mod common;

use beacon_core::config::BeaconConfig;
use beacon_core::crypto::Scheme;
use beacon_core::dkg::secret_proof;
use beacon_core::key::{FileStore, KeyPair};
use beacon_core::net::{ChainInfoRequest, ProtocolClient, PublicRandRequest, Service, SignalDkgPacket};
use beacon_core::protocol::{LeaderParams, SetupRole, V1};
use beacon_core::{Error, NetworkId, SetupRequest};
use common::*;
use std::time::Duration;

fn rand_request(id: &NetworkId, round: u64) -> PublicRandRequest {
    PublicRandRequest {
        beacon_id: id.clone(),
        round,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_produce_first_round() {
    let cluster = Cluster::new(3);
    let group = cluster.setup("V2", 3, 2, 100).await;
    let id = group.id();

    assert_eq!(group.len(), 3);
    assert_eq!(group.threshold, 2);
    assert_eq!(group.genesis_time, START + 100);
    let public = group.public_key().unwrap().clone();

    for node in &cluster.nodes {
        assert_eq!(node.server.ids(), vec![id.clone()]);
        let result = node.server.public_rand(&peer(), rand_request(&id, 0)).await;
        assert!(matches!(result, Err(Error::BeaconNotStarted)), "got {:?}", result);
    }

    cluster.clock.set(group.genesis_time);
    for node in &cluster.nodes {
        wait_round(&node.server, &id, 1).await;
    }

    let server = cluster.server(1);
    let latest = server.public_rand(&peer(), rand_request(&id, 0)).await.unwrap();
    assert_eq!(latest.round, 1);
    let first = server.public_rand(&peer(), rand_request(&id, 1)).await.unwrap();
    assert_eq!(first, latest);
    assert!(matches!(
        server.public_rand(&peer(), rand_request(&id, 2)).await,
        Err(Error::RoundNotFound(2))
    ));

    let chain = server.instance(&id).unwrap().chain().await.unwrap();
    let beacon = chain.store().get(1).unwrap().unwrap();
    Scheme::Unchained.verify_beacon(public.key(), &beacon).unwrap();
    assert_eq!(first.randomness, beacon.randomness());

    // every node stored the same round
    for node in &cluster.nodes {
        let other = node.server.public_rand(&peer(), rand_request(&id, 1)).await.unwrap();
        assert_eq!(other, first);
    }
    for node in &cluster.nodes {
        node.server.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chained_rounds_link_and_verify() {
    let cluster = Cluster::new(3);
    let group = cluster.setup(V1, 3, 2, 50).await;
    let id = group.id();
    let key = group.public_key().unwrap().key().to_vec();

    for round in 1..=5u64 {
        cluster
            .clock
            .set(group.genesis_time + ((round - 1) * PERIOD) as i64);
        for node in &cluster.nodes {
            wait_round(&node.server, &id, round).await;
        }
    }

    for node in &cluster.nodes {
        let chain = node.server.instance(&id).unwrap().chain().await.unwrap();
        let rounds = chain.store().range(0, 5).unwrap();
        assert_eq!(rounds.len(), 6);
        assert_eq!(rounds[0].signature, group.genesis_seed);
        for pair in rounds.windows(2) {
            assert_eq!(pair[1].round, pair[0].round + 1);
            assert_eq!(pair[1].previous_signature, pair[0].signature);
            Scheme::Chained.verify_beacon(&key, &pair[1]).unwrap();
        }
    }

    let info = cluster
        .server(2)
        .chain_info(
            &peer(),
            ChainInfoRequest { beacon_id: id.clone() },
        )
        .await
        .unwrap();
    assert_eq!(info.public_key, key);
    assert_eq!(info.scheme, Scheme::Chained.name());

    for node in &cluster.nodes {
        node.server.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unqualified_node_is_dropped_from_group() {
    let config = BeaconConfig {
        dkg_timeout: Duration::from_secs(1),
        ..beacon_config()
    };
    let cluster = Cluster::with_config(3, config);

    // signals, then never shows up for the DKG itself
    let ghost = KeyPair::generate("node-9", &mut rand::rngs::OsRng);
    let ghost_client = cluster.network.client("node-9");
    let leader = cluster.nodes[0].address.clone();
    let signal = tokio::spawn(async move {
        let packet = SignalDkgPacket {
            beacon_id: NetworkId::empty(),
            node: ghost.identity().clone(),
            secret_proof: secret_proof(SECRET.as_bytes()),
        };
        for _ in 0..100 {
            if ghost_client.signal_dkg_participant(&leader, packet.clone()).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("leader never accepted the signal");
    });

    let mut tasks = Vec::new();
    for (i, node) in cluster.nodes.iter().enumerate() {
        let role = if i == 0 {
            SetupRole::Leader(LeaderParams {
                nodes: 4,
                threshold: 2,
                period: PERIOD,
                delay: 60,
                dkg_timeout: 0,
            })
        } else {
            SetupRole::Participant {
                leader: cluster.nodes[0].address.clone(),
                leaving: false,
            }
        };
        let server = node.server.clone();
        let request = SetupRequest {
            version: "V2".into(),
            role,
            secret: SECRET.into(),
        };
        tasks.push(tokio::spawn(async move { server.setup(request).await }));
    }
    signal.await.unwrap();

    let mut groups = Vec::new();
    for task in tasks {
        groups.push(tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap());
    }
    let group = &groups[0];
    let addresses: Vec<_> = group.nodes.iter().map(|n| n.address().to_string()).collect();
    assert_eq!(addresses, vec!["node-0", "node-1", "node-2"]);
    for other in &groups {
        assert_eq!(other, group);
    }

    // share and group are on disk together, for every holder
    for node in &cluster.nodes {
        let store = FileStore::new(node.networks_dir().join(group.id().to_hex()));
        assert_eq!(store.load_group().unwrap(), *group);
        let share = store.load_share().unwrap();
        assert!(group.node(share.index).is_some());
        assert_eq!(store.load_version().unwrap().as_deref(), Some("V2"));
    }

    for node in &cluster.nodes {
        node.server.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_dkg_leaves_nothing_behind() {
    let config = BeaconConfig {
        dkg_timeout: Duration::from_secs(1),
        ..beacon_config()
    };
    let cluster = Cluster::with_config(2, config);

    // a third member that signals and never deals: two dealers for a
    // threshold of three
    let ghost = KeyPair::generate("node-9", &mut rand::rngs::OsRng);
    let ghost_client = cluster.network.client("node-9");
    let leader = cluster.nodes[0].address.clone();
    let signal = tokio::spawn(async move {
        let packet = SignalDkgPacket {
            beacon_id: NetworkId::empty(),
            node: ghost.identity().clone(),
            secret_proof: secret_proof(SECRET.as_bytes()),
        };
        for _ in 0..100 {
            if ghost_client.signal_dkg_participant(&leader, packet.clone()).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("leader never accepted the signal");
    });

    let mut tasks = Vec::new();
    for (i, node) in cluster.nodes.iter().enumerate() {
        let role = if i == 0 {
            SetupRole::Leader(LeaderParams {
                nodes: 3,
                threshold: 3,
                period: PERIOD,
                delay: 60,
                dkg_timeout: 0,
            })
        } else {
            SetupRole::Participant {
                leader: cluster.nodes[0].address.clone(),
                leaving: false,
            }
        };
        let server = node.server.clone();
        let request = SetupRequest {
            version: "V2".into(),
            role,
            secret: SECRET.into(),
        };
        tasks.push(tokio::spawn(async move { server.setup(request).await }));
    }
    signal.await.unwrap();

    for task in tasks {
        let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(result.is_err(), "got {:?}", result);
    }
    for node in &cluster.nodes {
        let dir = node.networks_dir();
        assert!(!dir.exists() || std::fs::read_dir(&dir).unwrap().next().is_none());
        assert!(node.server.ids().is_empty());
        assert!(node.server.describe().await.is_empty());
    }

    // the slot is free again: a setup the two nodes can complete
    let group = cluster.setup("V2", 2, 2, 60).await;
    for node in &cluster.nodes {
        assert_eq!(node.server.ids(), vec![group.id()]);
        let store = FileStore::new(node.networks_dir().join(group.id().to_hex()));
        assert_eq!(store.load_group().unwrap(), group);
    }

    for node in &cluster.nodes {
        node.server.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrong_secret_is_refused() {
    let cluster = Cluster::new(2);
    let leader = cluster.server(0);
    let task = tokio::spawn(async move {
        leader
            .setup(SetupRequest {
                version: "V2".into(),
                role: SetupRole::Leader(LeaderParams {
                    nodes: 2,
                    threshold: 1,
                    period: PERIOD,
                    delay: 60,
                    dkg_timeout: 0,
                }),
                secret: SECRET.into(),
            })
            .await
    });

    let participant = cluster.server(1);
    let result = participant
        .setup(SetupRequest {
            version: "V2".into(),
            role: SetupRole::Participant {
                leader: "node-0".into(),
                leaving: false,
            },
            secret: "wrong".into(),
        })
        .await;
    assert!(matches!(result, Err(Error::InvalidSecret)), "got {:?}", result);
    assert!(participant.ids().is_empty());
    assert!(participant.describe().await.is_empty());

    task.abort();
}
