//! Resharing a running network: one node leaves, one joins

mod common;

use beacon_core::chain::time_of_round;
use beacon_core::crypto::Scheme;
use beacon_core::key::FileStore;
use beacon_core::protocol::{LeaderParams, Lifecycle, Protocol, SetupRole, V2};
use beacon_core::{Error, Group, NetworkId, ReshareRequest};
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn request(id: &NetworkId, role: SetupRole) -> ReshareRequest {
    ReshareRequest {
        id: id.clone(),
        role,
        secret: SECRET.to_string(),
        version: Some(V2.to_string()),
    }
}

fn participant(leaving: bool) -> SetupRole {
    SetupRole::Participant {
        leader: "node-1".to_string(),
        leaving,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reshare_hands_over_without_overlap() {
    let mut cluster = Cluster::new(3);
    let group = cluster.setup(V2, 3, 2, 60).await;
    let id = group.id();
    let key = group.public_key().unwrap().key().to_vec();

    for round in 1..=3u64 {
        cluster.clock.set(time_of_round(PERIOD, group.genesis_time, round));
        for node in &cluster.nodes {
            wait_round(&node.server, &id, round).await;
        }
    }

    let joiner = cluster.add_node();
    assert_eq!(cluster.nodes[joiner].address, "node-3");

    // the leaving node only waits for the leader, get it waiting first
    let leaving = {
        let server = cluster.server(0);
        let req = request(&id, participant(true));
        tokio::spawn(async move { server.reshare(req).await })
    };
    let old_instance = cluster.server(0).instance(&id).unwrap();
    tokio::time::timeout(WAIT, async {
        while old_instance.lifecycle().await != Lifecycle::TransitionInProgress {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut tasks = vec![leaving];
    let roles = [
        (1, SetupRole::Leader(LeaderParams {
            nodes: 3,
            threshold: 2,
            period: 0,
            delay: 25,
            dkg_timeout: 0,
        })),
        (2, participant(false)),
        (3, participant(false)),
    ];
    for (index, role) in roles {
        let server = cluster.server(index);
        let req = request(&id, role);
        tasks.push(tokio::spawn(async move { server.reshare(req).await }));
    }
    let mut groups: Vec<Group> = Vec::new();
    for task in tasks {
        groups.push(tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap());
    }

    let new_group = groups[1].clone();
    let members: Vec<_> = new_group.nodes.iter().map(|n| n.address().to_string()).collect();
    assert_eq!(members, vec!["node-1", "node-2", "node-3"]);
    assert_eq!(new_group.id(), id);
    assert_eq!(new_group.public_key().unwrap().key(), key.as_slice());
    // now + 25s, moved up to the next round boundary
    let transition = new_group.transition_time;
    assert_eq!(transition, time_of_round(PERIOD, group.genesis_time, 6));
    assert_eq!(cluster.server(3).ids(), vec![id.clone()]);

    for round in 4..=8u64 {
        cluster.clock.set(time_of_round(PERIOD, group.genesis_time, round));
        for index in 1..=3 {
            wait_round(&cluster.server(index), &id, round).await;
        }
    }

    // the leaving node stopped strictly before the transition time
    let old_chain = old_instance.chain().await.unwrap();
    let old_last = old_chain.last().unwrap();
    assert!(time_of_round(PERIOD, group.genesis_time, old_last.round) < transition);
    tokio::time::timeout(WAIT, async {
        while matches!(old_instance.lifecycle().await, Lifecycle::Established { beacon_running: true }) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // one unbroken chain under the same key on every remaining member
    for index in 1..=3 {
        let instance = cluster.server(index).instance(&id).unwrap();
        let chain = instance.chain().await.unwrap();
        let rounds = chain.store().range(0, 8).unwrap();
        assert_eq!(rounds.len(), 9);
        for pair in rounds.windows(2) {
            assert_eq!(pair[1].round, pair[0].round + 1);
            assert_eq!(pair[1].previous_signature, pair[0].signature);
            Scheme::Unchained.verify_beacon(&key, &pair[1]).unwrap();
        }
        // rounds before the transition are the ones the old group made
        for round in 1..=old_last.round {
            assert_eq!(
                chain.store().get(round).unwrap(),
                old_chain.store().get(round).unwrap()
            );
        }
    }

    for node in &cluster.nodes {
        node.server.shutdown().await;
    }
}

async fn assert_unchanged(instance: &Arc<dyn Protocol>, store: &FileStore, group: &Group, secret: &[u8]) {
    assert_eq!(instance.group().await.as_ref(), Some(group));
    assert_eq!(&store.load_group().unwrap(), group);
    assert_eq!(store.load_share().unwrap().secret, secret);
    assert_eq!(
        instance.lifecycle().await,
        Lifecycle::Established { beacon_running: false }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stopped_member_keeps_its_group() {
    let cluster = Cluster::new(3);
    let group = cluster.setup(V2, 3, 2, 60).await;
    let id = group.id();
    let store = FileStore::new(cluster.nodes[2].networks_dir().join(id.to_hex()));
    let secret = store.load_share().unwrap().secret.clone();

    let instance = cluster.server(2).instance(&id).unwrap();
    instance.stop_beacon().await;

    // refused up front
    let refused = cluster.server(2).reshare(request(&id, participant(false))).await;
    assert!(matches!(refused, Err(Error::BeaconNotStarted)));
    assert_unchanged(&instance, &store, &group, &secret).await;

    // stopped while the resharing runs: the outcome is not adopted
    instance.start_beacon(false).await.unwrap();
    let stopped = {
        let server = cluster.server(2);
        let req = request(&id, participant(false));
        tokio::spawn(async move { server.reshare(req).await })
    };
    tokio::time::timeout(WAIT, async {
        while instance.lifecycle().await != Lifecycle::TransitionInProgress {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    instance.stop_beacon().await;

    let mut tasks = Vec::new();
    let roles = [
        (1, SetupRole::Leader(LeaderParams {
            nodes: 3,
            threshold: 2,
            period: 0,
            delay: 25,
            dkg_timeout: 0,
        })),
        (0, participant(false)),
    ];
    for (index, role) in roles {
        let server = cluster.server(index);
        let req = request(&id, role);
        tasks.push(tokio::spawn(async move { server.reshare(req).await }));
    }
    for task in tasks {
        let reshared = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_ne!(reshared.transition_time, 0);
    }

    let outcome = tokio::time::timeout(WAIT, stopped).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(Error::BeaconNotStarted)));
    assert_unchanged(&instance, &store, &group, &secret).await;

    for node in &cluster.nodes {
        node.server.shutdown().await;
    }
}
