//! Profile search scenarios: paging, limits, filters.

mod common;

use common::*;
use haven::crypto::Keypair;
use haven::net::message::{
    ConversationPayload, ConversationRequest, ProfileSearchQuery, Status,
};
use haven::types::SemVer;

fn query() -> ProfileSearchQuery {
    ProfileSearchQuery {
        name: "*".into(),
        profile_type: "*".into(),
        latitude: 0.0,
        longitude: 0.0,
        radius_m: 0,
        extra_data: String::new(),
        include_thumbnail_images: false,
        include_hosted_only: true,
        max_response_record_count: 100,
        max_total_record_count: 500,
    }
}

/// Insert `count` initialized identities straight into the store, spread
/// around the given center.
async fn seed_identities(
    ctx: &std::sync::Arc<haven::ServerContext>,
    count: usize,
    lat: f64,
    lon: f64,
    spread: f64,
) {
    for i in 0..count {
        let kp = Keypair::generate();
        let id = kp.identity_id();
        ctx.store
            .register_hosting(kp.public(), "individual", usize::MAX)
            .await
            .unwrap();
        // Deterministic spread: a grid around the center.
        let row = (i / 50) as f64;
        let col = (i % 50) as f64;
        ctx.store
            .apply_profile_update(
                &id,
                haven::db::ProfileChanges {
                    version: Some(SemVer::V1),
                    name: Some(format!("person-{}", i)),
                    location: Some((lat + row * spread, lon + col * spread)),
                    extra_data: Some(format!("tag:{}", i % 10)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
}

// Scenario: 2000 identities, radius search, immediate page + cached pages.
#[tokio::test]
async fn test_search_paging_over_cache() {
    let (_dir, ctx) = start_server().await;
    // 40 rows x 50 cols at ~1.1km pitch: everything within ~100km of the
    // center block, far more than max_total.
    seed_identities(&ctx, 2000, 50.0, 14.0, 0.01).await;

    let searcher = Keypair::generate();
    let mut client = connect(ctx.config.client_non_customer_port).await;
    client.start_conversation(&searcher).await.unwrap();

    let response = client
        .call(ConversationRequest::ProfileSearch(Box::new(
            ProfileSearchQuery {
                latitude: 50.0,
                longitude: 14.0,
                radius_m: 100_000,
                ..query()
            },
        )))
        .await
        .unwrap();
    let result = match ok_payload(&response) {
        ConversationPayload::ProfileSearch(r) => r.clone(),
        other => panic!("unexpected payload {:?}", other),
    };
    assert_eq!(result.total_record_count, 500);
    assert_eq!(result.records.len(), 100);
    assert_eq!(result.covered_servers.0, vec![ctx.server_id]);

    // Next page from the cache.
    let response = client
        .call(ConversationRequest::ProfileSearchPart {
            record_index: 100,
            record_count: 100,
        })
        .await
        .unwrap();
    match ok_payload(&response) {
        ConversationPayload::ProfileSearchPart { records } => assert_eq!(records.len(), 100),
        other => panic!("unexpected payload {:?}", other),
    }

    // Off the end of the cache.
    let response = client
        .call(ConversationRequest::ProfileSearchPart {
            record_index: 500,
            record_count: 1,
        })
        .await
        .unwrap();
    assert_eq!(response.status, Status::invalid("recordIndex"));
}

#[tokio::test]
async fn test_search_part_without_cache_not_available() {
    let (_dir, ctx) = start_server().await;
    let searcher = Keypair::generate();
    let mut client = connect(ctx.config.client_non_customer_port).await;
    client.start_conversation(&searcher).await.unwrap();

    let response = client
        .call(ConversationRequest::ProfileSearchPart {
            record_index: 0,
            record_count: 10,
        })
        .await
        .unwrap();
    assert_eq!(response.status, Status::NotAvailable);
}

#[tokio::test]
async fn test_search_response_limit_boundaries() {
    let (_dir, ctx) = start_server().await;
    let searcher = Keypair::generate();
    let mut client = connect(ctx.config.client_non_customer_port).await;
    client.start_conversation(&searcher).await.unwrap();

    // Exactly at the no-images cap passes.
    let response = client
        .call(ConversationRequest::ProfileSearch(Box::new(
            ProfileSearchQuery {
                max_response_record_count: 1000,
                max_total_record_count: 10_000,
                ..query()
            },
        )))
        .await
        .unwrap();
    assert!(response.status.is_ok(), "{:?}", response.status);

    // One more is rejected naming the field.
    let response = client
        .call(ConversationRequest::ProfileSearch(Box::new(
            ProfileSearchQuery {
                max_response_record_count: 1001,
                max_total_record_count: 10_000,
                ..query()
            },
        )))
        .await
        .unwrap();
    assert_eq!(response.status, Status::invalid("maxResponseRecordCount"));

    // With thumbnails the cap drops to 100.
    let response = client
        .call(ConversationRequest::ProfileSearch(Box::new(
            ProfileSearchQuery {
                include_thumbnail_images: true,
                max_response_record_count: 101,
                max_total_record_count: 1000,
                ..query()
            },
        )))
        .await
        .unwrap();
    assert_eq!(response.status, Status::invalid("maxResponseRecordCount"));

    // max_response must not exceed max_total.
    let response = client
        .call(ConversationRequest::ProfileSearch(Box::new(
            ProfileSearchQuery {
                max_response_record_count: 100,
                max_total_record_count: 50,
                ..query()
            },
        )))
        .await
        .unwrap();
    assert_eq!(response.status, Status::invalid("maxResponseRecordCount"));
}

#[tokio::test]
async fn test_search_filters_name_and_radius() {
    let (_dir, ctx) = start_server().await;
    seed_identities(&ctx, 100, 50.0, 14.0, 0.01).await;

    // One identity far away.
    let far = Keypair::generate();
    ctx.store
        .register_hosting(far.public(), "individual", usize::MAX)
        .await
        .unwrap();
    ctx.store
        .apply_profile_update(
            &far.identity_id(),
            haven::db::ProfileChanges {
                version: Some(SemVer::V1),
                name: Some("faraway".into()),
                location: Some((-33.9, 151.2)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let searcher = Keypair::generate();
    let mut client = connect(ctx.config.client_non_customer_port).await;
    client.start_conversation(&searcher).await.unwrap();

    // Wildcard name narrows to one record.
    let response = client
        .call(ConversationRequest::ProfileSearch(Box::new(
            ProfileSearchQuery {
                name: "person-42".into(),
                ..query()
            },
        )))
        .await
        .unwrap();
    match ok_payload(&response) {
        ConversationPayload::ProfileSearch(r) => {
            assert_eq!(r.total_record_count, 1);
            assert_eq!(r.records.0[0].name, "person-42");
        }
        other => panic!("unexpected payload {:?}", other),
    }

    // Radius filter drops the faraway identity.
    let response = client
        .call(ConversationRequest::ProfileSearch(Box::new(
            ProfileSearchQuery {
                latitude: 50.0,
                longitude: 14.0,
                radius_m: 200_000,
                ..query()
            },
        )))
        .await
        .unwrap();
    match ok_payload(&response) {
        ConversationPayload::ProfileSearch(r) => {
            assert_eq!(r.total_record_count, 100);
            assert!(r.records.iter().all(|rec| rec.name != "faraway"));
        }
        other => panic!("unexpected payload {:?}", other),
    }

    // Extra-data regex.
    let response = client
        .call(ConversationRequest::ProfileSearch(Box::new(
            ProfileSearchQuery {
                extra_data: "^tag:7$".into(),
                ..query()
            },
        )))
        .await
        .unwrap();
    match ok_payload(&response) {
        ConversationPayload::ProfileSearch(r) => {
            assert_eq!(r.total_record_count, 10);
            assert!(r.records.iter().all(|rec| rec.extra_data == "tag:7"));
        }
        other => panic!("unexpected payload {:?}", other),
    }

    // Broken regex names the field.
    let response = client
        .call(ConversationRequest::ProfileSearch(Box::new(
            ProfileSearchQuery {
                extra_data: "(".into(),
                ..query()
            },
        )))
        .await
        .unwrap();
    assert_eq!(response.status, Status::invalid("extraData"));
}

#[tokio::test]
async fn test_search_requires_conversation() {
    let (_dir, ctx) = start_server().await;
    let mut client = connect(ctx.config.client_non_customer_port).await;

    let response = client
        .call(ConversationRequest::ProfileSearch(Box::new(query())))
        .await
        .unwrap();
    assert_eq!(response.status, Status::BadConversationStatus);
}
