//! Neighborhood replication: initialization streaming, update propagation,
//! inbound idempotence.

mod common;

use common::*;
use haven::crypto::Keypair;
use haven::db::ProfileChanges;
use haven::net::message::{
    SharedProfileAdd, SharedProfileChange, SharedProfileUpdateItem,
};
use haven::replication::join_neighborhood;
use haven::types::SemVer;
use std::net::SocketAddr;
use std::time::Duration;

async fn host_profile(
    ctx: &std::sync::Arc<haven::ServerContext>,
    name: &str,
) -> Keypair {
    let kp = Keypair::generate();
    ctx.store
        .register_hosting(kp.public(), "individual", usize::MAX)
        .await
        .unwrap();
    ctx.store
        .apply_profile_update(
            &kp.identity_id(),
            ProfileChanges {
                version: Some(SemVer::V1),
                name: Some(name.to_string()),
                location: Some((50.0, 14.4)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    kp
}

fn neighbor_addr(ctx: &haven::ServerContext) -> SocketAddr {
    format!("127.0.0.1:{}", ctx.config.server_neighbor_port)
        .parse()
        .unwrap()
}

/// Wait until `check` passes or the deadline runs out.
async fn eventually<F: Fn() -> bool>(check: F, secs: u64, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

// Scenario: follower joins, receives the snapshot in acknowledged batches,
// and the leader's follower row becomes initialized.
#[tokio::test]
async fn test_neighborhood_initialization() {
    let (_dir_a, leader) = start_server().await;
    let (_dir_b, follower) = start_server().await;

    for i in 0..25 {
        host_profile(&leader, &format!("hosted-{}", i)).await;
    }

    let neighbor_id = join_neighborhood(&follower, neighbor_addr(&leader))
        .await
        .expect("join");
    assert_eq!(neighbor_id, leader.server_id);

    // The follower replicated the snapshot.
    assert_eq!(follower.store.count_neighbor_profiles(), 25);
    let neighbor = follower
        .store
        .get_neighbor_server(&leader.server_id)
        .unwrap()
        .unwrap();
    assert!(neighbor.last_refresh_at.is_some());

    // The leader's follower row becomes initialized once it processes the
    // final acknowledgement.
    let leader_ctx = leader.clone();
    let follower_id = follower.server_id;
    eventually(
        move || {
            leader_ctx
                .store
                .get_follower(&follower_id)
                .ok()
                .flatten()
                .is_some_and(|f| f.last_refresh_at.is_some())
        },
        10,
        "follower row to initialize",
    )
    .await;
}

// After initialization, a profile change on the leader reaches the follower
// through the action worker.
#[tokio::test]
async fn test_update_propagates_to_follower() {
    let (_dir_a, leader) = start_server().await;
    let (_dir_b, follower) = start_server().await;

    let hosted = host_profile(&leader, "original").await;
    join_neighborhood(&follower, neighbor_addr(&leader))
        .await
        .expect("join");

    // Change the profile on the leader; an action is queued per follower and
    // the worker delivers it.
    leader
        .store
        .apply_profile_update(
            &hosted.identity_id(),
            ProfileChanges {
                name: Some("renamed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    leader.worker_signal.notify_one();

    let follower_store = follower.clone();
    let id = hosted.identity_id();
    let leader_id = leader.server_id;
    eventually(
        move || {
            follower_store
                .store
                .get_neighbor_profile(&id, &leader_id)
                .ok()
                .flatten()
                .is_some_and(|p| p.name == "renamed")
        },
        20,
        "rename to propagate",
    )
    .await;

    // The delivered action is gone from the queue.
    assert_eq!(leader.store.count_actions(), 0);
}

// A new hosted identity after initialization propagates as an Add.
#[tokio::test]
async fn test_new_profile_propagates_to_follower() {
    let (_dir_a, leader) = start_server().await;
    let (_dir_b, follower) = start_server().await;

    join_neighborhood(&follower, neighbor_addr(&leader))
        .await
        .expect("join");
    assert_eq!(follower.store.count_neighbor_profiles(), 0);

    let hosted = host_profile(&leader, "late-arrival").await;
    leader.worker_signal.notify_one();

    let follower_ctx = follower.clone();
    let id = hosted.identity_id();
    let leader_id = leader.server_id;
    eventually(
        move || {
            follower_ctx
                .store
                .get_neighbor_profile(&id, &leader_id)
                .ok()
                .flatten()
                .is_some()
        },
        20,
        "add to propagate",
    )
    .await;
}

// Applying [Add X, Change X, Delete X] leaves the neighbor repository as it
// was before.
#[tokio::test]
async fn test_add_change_delete_is_idempotent() {
    let (_dir, ctx) = start_server().await;
    let neighbor_id = [3u8; 32];

    // The inbound path requires an initialized neighbor row.
    ctx.store
        .upsert_neighbor_server(haven::db::NeighborServer {
            neighbor_id,
            ip: "127.0.0.1".parse().unwrap(),
            neighbor_port: 1,
            last_refresh_at: Some(haven::now()),
        })
        .await
        .unwrap();

    let kp = Keypair::generate();
    let before = ctx.store.count_neighbor_profiles();

    let items = vec![
        SharedProfileUpdateItem::Add(Box::new(SharedProfileAdd {
            public_key: kp.public(),
            version: SemVer::V1,
            name: "transient".into(),
            profile_type: "person".into(),
            latitude: 1.0,
            longitude: 2.0,
            extra_data: String::new(),
            thumbnail_image: Default::default(),
        })),
        SharedProfileUpdateItem::Change(Box::new(SharedProfileChange {
            identity_id: kp.identity_id(),
            set_name: true,
            name: "renamed".into(),
            ..Default::default()
        })),
        SharedProfileUpdateItem::Delete {
            identity_id: kp.identity_id(),
        },
    ];

    let status = haven::replication::inbound::process_update(&ctx, &neighbor_id, items).await;
    assert!(status.is_ok(), "{:?}", status);
    assert_eq!(ctx.store.count_neighbor_profiles(), before);
}

// An update from a server that never initialized a neighborhood with us is
// rejected.
#[tokio::test]
async fn test_update_from_stranger_rejected() {
    let (_dir, ctx) = start_server().await;
    let stranger = Keypair::generate();

    let mut client = connect(ctx.config.server_neighbor_port).await;
    client.handshake(&stranger).await.unwrap();
    let response = client
        .call(
            haven::net::message::ConversationRequest::NeighborhoodSharedProfileUpdate {
                items: haven::net::serde_safe::BoundedVec::new_unchecked(vec![
                    SharedProfileUpdateItem::Refresh,
                ]),
            },
        )
        .await
        .unwrap();
    assert_eq!(response.status, haven::net::message::Status::Rejected);
}

// A validation failure at item k applies the prefix and names the item and
// field.
#[tokio::test]
async fn test_partial_bundle_applies_prefix() {
    let (_dir, ctx) = start_server().await;
    let neighbor_id = [4u8; 32];
    ctx.store
        .upsert_neighbor_server(haven::db::NeighborServer {
            neighbor_id,
            ip: "127.0.0.1".parse().unwrap(),
            neighbor_port: 1,
            last_refresh_at: Some(haven::now()),
        })
        .await
        .unwrap();

    let good = Keypair::generate();
    let items = vec![
        SharedProfileUpdateItem::Add(Box::new(SharedProfileAdd {
            public_key: good.public(),
            version: SemVer::V1,
            name: "kept".into(),
            profile_type: "person".into(),
            latitude: 0.0,
            longitude: 0.0,
            extra_data: String::new(),
            thumbnail_image: Default::default(),
        })),
        SharedProfileUpdateItem::Add(Box::new(SharedProfileAdd {
            public_key: Keypair::generate().public(),
            version: SemVer::V1,
            name: String::new(), // invalid
            profile_type: "person".into(),
            latitude: 0.0,
            longitude: 0.0,
            extra_data: String::new(),
            thumbnail_image: Default::default(),
        })),
    ];

    let status = haven::replication::inbound::process_update(&ctx, &neighbor_id, items).await;
    assert_eq!(
        status,
        haven::net::message::Status::invalid("1.add.name")
    );
    // Item 0 still went through.
    assert!(ctx
        .store
        .get_neighbor_profile(&good.identity_id(), &neighbor_id)
        .unwrap()
        .is_some());
}

// StopNeighborhoodUpdates drops the follower row and its queue.
#[tokio::test]
async fn test_stop_neighborhood_updates() {
    let (_dir_a, leader) = start_server().await;
    let (_dir_b, follower) = start_server().await;

    join_neighborhood(&follower, neighbor_addr(&leader))
        .await
        .expect("join");
    assert_eq!(leader.store.count_followers(), 1);

    // The follower unsubscribes using its own node identity.
    let mut client = connect(leader.config.server_neighbor_port).await;
    client.handshake(&follower.keypair).await.unwrap();
    let response = client
        .call(haven::net::message::ConversationRequest::StopNeighborhoodUpdates)
        .await
        .unwrap();
    assert!(response.status.is_ok());
    assert_eq!(leader.store.count_followers(), 0);
}

// Admission gates: the follower cap answers Rejected.
#[tokio::test]
async fn test_follower_cap_rejected() {
    let (_dir_a, leader) = start_server_with(|c| c.max_followers = 0).await;
    let kp = Keypair::generate();

    let mut client = connect(leader.config.server_neighbor_port).await;
    client.handshake(&kp).await.unwrap();
    let response = client
        .call(
            haven::net::message::ConversationRequest::StartNeighborhoodInitialization {
                primary_port: 16987,
                neighbor_port: 16988,
            },
        )
        .await
        .unwrap();
    assert_eq!(response.status, haven::net::message::Status::Rejected);
}
