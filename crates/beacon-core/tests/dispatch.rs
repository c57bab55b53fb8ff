//! Routing by identifier, the legacy alias and loading networks from disk

mod common;

use beacon_core::chain::time_of_round;
use beacon_core::crypto::Scheme;
use beacon_core::dkg::secret_proof;
use beacon_core::net::{DkgInfoPacket, HomeRequest, PartialBeaconPacket, PublicRandRequest, Service};
use beacon_core::protocol::{Lifecycle, Registry, SetupRole, V1, V2};
use beacon_core::{Error, Group, NetworkId, ReshareRequest, Server, SetupRequest};
use common::*;
use std::sync::Arc;
use std::time::Duration;

const LEGACY_SECRET: &str = "legacy network secret";

fn rand_request(id: NetworkId, round: u64) -> PublicRandRequest {
    PublicRandRequest { beacon_id: id, round }
}

#[tokio::test]
async fn test_routing_without_networks() {
    let cluster = Cluster::new(1);
    let server = cluster.server(0);

    assert!(matches!(
        server.public_rand(&peer(), rand_request(NetworkId::empty(), 0)).await,
        Err(Error::MissingIdentifier)
    ));
    let unknown = NetworkId::new(vec![0xab; 32]);
    assert!(matches!(
        server.public_rand(&peer(), rand_request(unknown.clone(), 0)).await,
        Err(Error::UnknownNetwork(id)) if id == unknown
    ));
    let packet = PartialBeaconPacket {
        beacon_id: NetworkId::empty(),
        round: 1,
        previous_signature: vec![],
        partial_sig: vec![],
    };
    assert!(matches!(
        server.partial_beacon(&peer(), packet).await,
        Err(Error::MissingIdentifier)
    ));
    assert!(matches!(server.terminate(&unknown).await, Err(Error::UnknownNetwork(_))));

    let home = server
        .home(&peer(), HomeRequest::default())
        .await
        .unwrap();
    assert!(home.status.contains("node-0"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_legacy_alias_takes_empty_identifier() {
    let cluster = Cluster::new(1);
    let node = &cluster.nodes[0];
    let dir = node.networks_dir();
    let legacy = write_network(&dir, &node.keypair, None, START + 10, Some("default"));
    let versioned = write_network(&dir, &node.keypair, Some(V2), START + 20, None);

    let server = &node.server;
    let report = server.load_instances();
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.loaded.len(), 2);
    assert_eq!(server.alias(), Some(legacy.id()));
    assert!(server.instance(&legacy.id()).unwrap().is_legacy());
    assert_eq!(server.instance(&versioned.id()).unwrap().version(), V2);

    server.start_all(false).await;
    cluster.clock.set(START + 10);
    wait_round(server, &legacy.id(), 1).await;

    let by_alias = server
        .public_rand(&peer(), rand_request(NetworkId::empty(), 1))
        .await
        .unwrap();
    let by_id = server
        .public_rand(&peer(), rand_request(legacy.id(), 1))
        .await
        .unwrap();
    assert_eq!(by_alias, by_id);
    // the other network has not reached its genesis
    assert!(matches!(
        server.public_rand(&peer(), rand_request(versioned.id(), 0)).await,
        Err(Error::BeaconNotStarted)
    ));

    server.terminate(&NetworkId::empty()).await.unwrap();
    assert_eq!(server.alias(), None);
    assert_eq!(server.ids(), vec![versioned.id()]);
    assert!(!dir.join("default").exists());
    assert!(matches!(
        server.public_rand(&peer(), rand_request(NetworkId::empty(), 0)).await,
        Err(Error::MissingIdentifier)
    ));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resharing_legacy_network_takes_empty_identifier() {
    let cluster = Cluster::new(1);
    let node = &cluster.nodes[0];
    let legacy = write_network(&node.networks_dir(), &node.keypair, None, START + 10, Some("default"));
    let server = node.server.clone();
    assert!(server.load_instances().is_ok());
    server.start_all(false).await;

    // the legacy network waits for a resharing leader, a fresh setup for
    // its own leader; neither leader is reachable
    let reshare = {
        let server = server.clone();
        let legacy_id = legacy.id();
        tokio::spawn(async move {
            server
                .reshare(ReshareRequest {
                    id: legacy_id,
                    role: SetupRole::Participant {
                        leader: "node-7".into(),
                        leaving: false,
                    },
                    secret: LEGACY_SECRET.into(),
                    version: None,
                })
                .await
        })
    };
    let instance = server.instance(&legacy.id()).unwrap();
    tokio::time::timeout(WAIT, async {
        while instance.lifecycle().await != Lifecycle::TransitionInProgress {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let setup = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .setup(SetupRequest {
                    version: V2.into(),
                    role: SetupRole::Participant {
                        leader: "node-8".into(),
                        leaving: false,
                    },
                    secret: SECRET.into(),
                })
                .await
        })
    };
    tokio::time::timeout(WAIT, async {
        while server.describe().await.len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // a group this node is not part of: the legacy receiver accepts the
    // secret and then refuses the group, the setup would refuse the secret
    let stranger = keypair("node-5", 5).identity().clone();
    let info = |secret: &str| DkgInfoPacket {
        beacon_id: NetworkId::empty(),
        new_group: Group::new(vec![stranger.clone()], 1, PERIOD, START),
        old_group: Some(Group::new(vec![stranger.clone()], 1, PERIOD, START)),
        secret_proof: secret_proof(secret.as_bytes()),
        dkg_timeout: 0,
    };
    assert!(matches!(
        server.push_dkg_info(&peer(), info(LEGACY_SECRET)).await,
        Err(Error::NotInGroup(_))
    ));
    assert!(matches!(
        server.push_dkg_info(&peer(), info(SECRET)).await,
        Err(Error::InvalidSecret)
    ));

    reshare.abort();
    setup.abort();
    server.shutdown().await;
}

#[tokio::test]
async fn test_load_report_keeps_good_networks() {
    let cluster = Cluster::new(1);
    let node = &cluster.nodes[0];
    let dir = node.networks_dir();

    let chained = write_network(&dir, &node.keypair, Some(V1), START + 10, None);
    let unchained = write_network(&dir, &node.keypair, Some(V2), START + 20, None);
    let legacy = write_network(&dir, &node.keypair, None, START + 30, Some("legacy-a"));
    write_network(&dir, &node.keypair, None, START + 40, Some("legacy-b"));
    write_network(&dir, &node.keypair, Some("V7"), START + 50, Some("ffff"));
    // folder name and content disagree
    write_network(&dir, &node.keypair, Some(V2), START + 60, Some("00aa"));
    // version marker but nothing else
    std::fs::create_dir_all(dir.join("beef")).unwrap();
    std::fs::write(dir.join("beef").join("version"), V2).unwrap();

    let report = node.server.load_instances();

    let mut loaded = report.loaded.clone();
    loaded.sort();
    let mut expected = vec![chained.id(), unchained.id(), legacy.id()];
    expected.sort();
    assert_eq!(loaded, expected);
    assert_eq!(node.server.alias(), Some(legacy.id()));

    let failed: Vec<_> = report.errors.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(failed, vec!["00aa", "beef", "ffff", "legacy-b"]);
    for (name, error) in &report.errors {
        match name.as_str() {
            "00aa" => assert!(matches!(error, Error::Storage(_))),
            "beef" => assert!(matches!(error, Error::Storage(_))),
            "ffff" => assert!(matches!(error, Error::UnknownVersion(v) if v == "V7")),
            "legacy-b" => assert!(matches!(error, Error::DuplicateLegacyInstance(_))),
            other => panic!("unexpected failure for {}", other),
        }
    }
}

#[tokio::test]
async fn test_blacklisted_version_is_not_loaded() {
    let cluster = Cluster::new(1);
    let node = &cluster.nodes[0];
    let dir = node.networks_dir();
    write_network(&dir, &node.keypair, Some(V1), START + 10, None);
    let kept = write_network(&dir, &node.keypair, Some(V2), START + 20, None);

    let config = node.server.config().clone();
    let server = Server::new(Registry::standard().with_blacklist(&[V1]), config);
    let report = server.load_instances();
    assert_eq!(report.loaded, vec![kept.id()]);
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(report.errors[0].1, Error::BlacklistedVersion(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_resumes_chain() {
    let cluster = Cluster::new(1);
    let node = &cluster.nodes[0];
    let group = write_network(&node.networks_dir(), &node.keypair, Some(V1), START + 10, None);
    let id = group.id();

    node.server.load_instances();
    node.server.start_all(false).await;
    for round in 1..=3 {
        cluster.clock.set(time_of_round(PERIOD, group.genesis_time, round));
        wait_round(&node.server, &id, round).await;
    }
    node.server.shutdown().await;

    let restarted = Arc::new(cluster.server_at(&node.address, node.keypair.clone(), &node.root));
    let report = restarted.load_instances();
    assert_eq!(report.loaded, vec![id.clone()]);
    let chain = restarted.instance(&id).unwrap().chain().await.unwrap();
    assert!(chain.last_round() >= 3);

    restarted.start_all(true).await;
    for round in 4..=6 {
        cluster.clock.set(time_of_round(PERIOD, group.genesis_time, round));
        wait_round(&restarted, &id, round).await;
    }

    let key = group.public_key().unwrap().key().to_vec();
    let rounds = chain.store().range(1, 6).unwrap();
    assert_eq!(rounds.len(), 6);
    for pair in rounds.windows(2) {
        assert_eq!(pair[1].previous_signature, pair[0].signature);
        Scheme::Chained
            .verify_beacon(&key, &pair[1])
            .unwrap();
    }
    restarted.shutdown().await;
}
