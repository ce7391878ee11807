//! End-to-end pipeline tests
//!
//! Records flow through fetch, thumbnails, validation and the writer against
//! a wiremock asset server, a temporary blob directory and the in-memory
//! entity store.

mod common;

use anyhow::Result;
use common::{base_config, init_tracing, key_of, png_bytes, raw, CapturedLogs, Harness};
use harvest_pipeline::blob::StoreFormat;
use harvest_pipeline::config::{DecodePolicy, FetchPolicy, PipelineConfig};
use harvest_pipeline::error::{FetchCause, SubmitError};
use harvest_pipeline::outcome::{
    CommitKind, DropReason, ErrorCause, OutcomeStatus, OutcomeWarning,
};
use harvest_pipeline::record::{AssetReference, FieldValue};
use harvest_pipeline::StageKind;
use image::GenericImageView;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve_png(server: &MockServer, at: &str, bytes: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(bytes)
                .insert_header("content-type", "image/png"),
        )
        .mount(server)
        .await;
}

// ============================================================================
// Happy path and idempotence
// ============================================================================

#[tokio::test]
async fn test_record_with_image_is_committed_with_thumbnails() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    let png = png_bytes(120, 80);
    serve_png(&server, "/img/1.png", png.clone()).await;

    let harness = Harness::new(StoreFormat::All)?;
    let config = base_config();
    let url = format!("{}/item/1", server.uri());
    let record = json!({
        "url": url,
        "title": "First item",
        "price": 12.5,
        "image": format!("{}/img/1.png", server.uri()),
    });

    let run = harness.run(&config, vec![record.clone()]).await?;
    let key = key_of(&url);
    let outcome = run.outcome(&key).expect("outcome for the record");
    assert_eq!(outcome.commit_kind(), Some(CommitKind::Inserted));
    assert!(outcome.warnings.is_empty());
    assert_eq!(run.summary.inserted, 1);

    let entity = harness.store.get(&key).await.expect("stored entity");
    assert_eq!(entity.fields["title"], FieldValue::Text("First item".to_string()));
    assert_eq!(entity.fields["price"], FieldValue::Number(12.5));

    let asset = match &entity.fields["image"] {
        FieldValue::Asset(AssetReference::Resolved(asset)) => asset.clone(),
        other => panic!("expected resolved asset, got {other:?}"),
    };
    assert_eq!(asset.size, png.len() as u64);
    assert_eq!(asset.path, format!("full/{}", asset.hash));
    assert_eq!(asset.thumbnails.len(), 2);

    let medium = image::open(harness.blobs.resolve(&asset.thumbnails["medium"]))?;
    assert_eq!(medium.dimensions(), (50, 50));
    let small = image::open(harness.blobs.resolve(&asset.thumbnails["small"]))?;
    assert_eq!(small.dimensions(), (25, 25));

    // Same record again: nothing changes, nothing is written
    let rerun = harness.run(&config, vec![record]).await?;
    assert_eq!(
        rerun.outcome(&key).and_then(|o| o.commit_kind()),
        Some(CommitKind::Unchanged)
    );
    assert_eq!(harness.store.mutations(), 1);
    assert_eq!(harness.store.len().await, 1);

    Ok(())
}

#[tokio::test]
async fn test_changed_field_updates_existing_entity() -> Result<()> {
    init_tracing();
    let harness = Harness::new(StoreFormat::All)?;
    let config = PipelineConfig {
        stages: vec!["validate".to_string(), "write".to_string()],
        ..base_config()
    };

    let run = harness
        .run(
            &config,
            vec![json!({"url": "http://shop/1", "title": "Old", "sku": "A-1"})],
        )
        .await?;
    assert_eq!(run.summary.inserted, 1);

    let run = harness
        .run(&config, vec![json!({"url": "http://shop/1", "title": "New"})])
        .await?;
    assert_eq!(run.summary.updated, 1);

    let entity = harness.store.get(&key_of("http://shop/1")).await.expect("entity");
    assert_eq!(entity.fields["title"], FieldValue::Text("New".to_string()));
    // Fields absent from the newer record are kept
    assert_eq!(entity.fields["sku"], FieldValue::Text("A-1".to_string()));

    Ok(())
}

#[tokio::test]
async fn test_thumbs_format_points_record_at_first_thumbnail() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    serve_png(&server, "/img.png", png_bytes(64, 64)).await;

    let harness = Harness::new(StoreFormat::Thumbs)?;
    let mut config = base_config();
    config.images.store_format = StoreFormat::Thumbs;

    let url = format!("{}/item", server.uri());
    harness
        .run(
            &config,
            vec![json!({"url": url, "title": "T", "image": format!("{}/img.png", server.uri())})],
        )
        .await?;

    let entity = harness.store.get(&key_of(&url)).await.expect("entity");
    let asset = match &entity.fields["image"] {
        FieldValue::Asset(AssetReference::Resolved(asset)) => asset.clone(),
        other => panic!("expected resolved asset, got {other:?}"),
    };
    assert_eq!(asset.path, format!("thumbs/medium/{}.jpg", asset.hash));
    assert!(harness.blobs.resolve(&format!("full/{}", asset.hash)).exists());

    Ok(())
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_missing_mandatory_field_is_dropped_without_write() -> Result<()> {
    init_tracing();
    let harness = Harness::new(StoreFormat::All)?;
    let config = PipelineConfig {
        stages: vec!["validate".to_string(), "write".to_string()],
        ..base_config()
    };

    let run = harness
        .run(&config, vec![json!({"url": "http://shop/untitled", "price": 3})])
        .await?;

    let outcome = run.outcome(&key_of("http://shop/untitled")).expect("outcome");
    match &outcome.status {
        OutcomeStatus::Dropped {
            reason: DropReason::ValidationFailed { failures },
        } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].field, "title");
        },
        other => panic!("expected validation drop, got {other:?}"),
    }
    assert_eq!(run.summary.dropped, 1);
    assert_eq!(harness.store.lookups(), 0);
    assert_eq!(harness.store.mutations(), 0);

    Ok(())
}

#[tokio::test]
async fn test_advisory_rule_warns_but_commits() -> Result<()> {
    init_tracing();
    let harness = Harness::new(StoreFormat::All)?;
    let config = PipelineConfig::from_toml_str(
        r#"
        stages = ["validate", "write"]
        mandatory_fields = ["title"]

        [[validation.rules]]
        kind = "pattern"
        field = "title"
        regex = "^[A-Z]"
        severity = "advisory"

        [[validation.rules]]
        kind = "range"
        field = "price"
        min = 0.0
        "#,
    )?;

    let run = harness
        .run(
            &config,
            vec![
                json!({"url": "http://shop/1", "title": "lowercase", "price": 4}),
                json!({"url": "http://shop/2", "title": "Fine", "price": -1}),
            ],
        )
        .await?;

    let warned = run.outcome(&key_of("http://shop/1")).expect("outcome");
    assert_eq!(warned.commit_kind(), Some(CommitKind::Inserted));
    assert!(matches!(
        warned.warnings.as_slice(),
        [OutcomeWarning::Advisory { failures }] if failures[0].rule == "pattern:title"
    ));

    let rejected = run.outcome(&key_of("http://shop/2")).expect("outcome");
    assert!(rejected.is_dropped());
    assert_eq!(run.summary.with_warnings, 1);

    Ok(())
}

// ============================================================================
// Fetch failures and policies
// ============================================================================

#[tokio::test]
async fn test_persistent_server_error_errors_only_that_record() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken.png"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;
    serve_png(&server, "/ok.png", png_bytes(30, 30)).await;

    let harness = Harness::new(StoreFormat::All)?;
    let broken = format!("{}/item/broken", server.uri());
    let healthy = format!("{}/item/ok", server.uri());

    let run = harness
        .run(
            &base_config(),
            vec![
                json!({"url": broken, "title": "B", "image": format!("{}/broken.png", server.uri())}),
                json!({"url": healthy, "title": "H", "image": format!("{}/ok.png", server.uri())}),
            ],
        )
        .await?;

    let outcome = run.outcome(&key_of(&broken)).expect("broken outcome");
    match &outcome.status {
        OutcomeStatus::Errored {
            stage: StageKind::FetchAssets,
            cause: ErrorCause::FetchFailed(failed),
        } => {
            assert_eq!(failed.attempts, 3);
            assert_eq!(failed.cause, FetchCause::Status { code: 500 });
        },
        other => panic!("expected fetch error, got {other:?}"),
    }

    assert_eq!(
        run.outcome(&key_of(&healthy)).and_then(|o| o.commit_kind()),
        Some(CommitKind::Inserted)
    );
    assert_eq!(run.summary.errored, 1);
    assert_eq!(run.summary.inserted, 1);
    assert!(harness.store.get(&key_of(&broken)).await.is_none());

    Ok(())
}

#[tokio::test]
async fn test_skip_asset_policy_commits_without_the_asset() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.png"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(StoreFormat::All)?;
    let mut config = base_config();
    config.policy.fetch = FetchPolicy::SkipAsset;

    let url = format!("{}/item", server.uri());
    let run = harness
        .run(
            &config,
            vec![json!({"url": url, "title": "T", "image": format!("{}/missing.png", server.uri())})],
        )
        .await?;

    let outcome = run.outcome(&key_of(&url)).expect("outcome");
    assert_eq!(outcome.commit_kind(), Some(CommitKind::Inserted));
    assert!(matches!(
        outcome.warnings.as_slice(),
        [OutcomeWarning::AssetSkipped { field, .. }] if field == "image"
    ));

    let entity = harness.store.get(&key_of(&url)).await.expect("entity");
    assert!(!entity.fields.contains_key("image"));

    Ok(())
}

#[tokio::test]
async fn test_drop_policy_drops_record() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let harness = Harness::new(StoreFormat::All)?;
    let mut config = base_config();
    config.policy.fetch = FetchPolicy::Drop;

    let url = format!("{}/item", server.uri());
    let run = harness
        .run(
            &config,
            vec![json!({"url": url, "title": "T", "image": format!("{}/a.png", server.uri())})],
        )
        .await?;

    let outcome = run.outcome(&key_of(&url)).expect("outcome");
    assert!(matches!(
        outcome.status,
        OutcomeStatus::Dropped {
            reason: DropReason::FetchFailed(_)
        }
    ));
    assert_eq!(harness.store.mutations(), 0);

    Ok(())
}

// ============================================================================
// Decode failures
// ============================================================================

#[tokio::test]
async fn test_undecodable_asset_continues_without_thumbnails() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    serve_png(&server, "/fake.png", b"<html>not an image</html>".to_vec()).await;

    let harness = Harness::new(StoreFormat::All)?;
    let url = format!("{}/item", server.uri());
    let record = json!({"url": url, "title": "T", "image": format!("{}/fake.png", server.uri())});

    let run = harness.run(&base_config(), vec![record.clone()]).await?;
    let outcome = run.outcome(&key_of(&url)).expect("outcome");
    assert_eq!(outcome.commit_kind(), Some(CommitKind::Inserted));
    assert!(matches!(
        outcome.warnings.as_slice(),
        [OutcomeWarning::DecodeFailed { field, .. }] if field == "image"
    ));

    let entity = harness.store.get(&key_of(&url)).await.expect("entity");
    match &entity.fields["image"] {
        FieldValue::Asset(AssetReference::Resolved(asset)) => assert!(asset.thumbnails.is_empty()),
        other => panic!("expected resolved asset, got {other:?}"),
    }

    let mut config = base_config();
    config.policy.decode = DecodePolicy::Drop;
    let other = format!("{}/other", server.uri());
    let run = harness
        .run(
            &config,
            vec![json!({"url": other, "title": "T", "image": format!("{}/fake.png", server.uri())})],
        )
        .await?;
    assert!(matches!(
        run.outcome(&key_of(&other)).map(|o| &o.status),
        Some(OutcomeStatus::Dropped {
            reason: DropReason::DecodeFailed(_)
        })
    ));

    Ok(())
}

// ============================================================================
// Deadlines, log limit and cancellation
// ============================================================================

#[tokio::test]
async fn test_record_deadline_errors_slow_fetch() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(png_bytes(10, 10))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(StoreFormat::All)?;
    let mut config = base_config();
    config.record_timeout_secs = Some(1);

    let url = format!("{}/item", server.uri());
    let run = harness
        .run(
            &config,
            vec![json!({"url": url, "title": "T", "image": format!("{}/slow.png", server.uri())})],
        )
        .await?;

    let outcome = run.outcome(&key_of(&url)).expect("outcome");
    assert_eq!(
        outcome.status,
        OutcomeStatus::Errored {
            stage: StageKind::FetchAssets,
            cause: ErrorCause::Timeout
        }
    );
    assert_eq!(harness.store.mutations(), 0);

    Ok(())
}

#[tokio::test]
async fn test_log_limit_reports_first_failures_and_counts_the_rest() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let harness = Harness::new(StoreFormat::All)?;
    let mut config = base_config();
    config.fetch.max_attempts = 1;
    config.log.limit = 5;

    let records = (0..10)
        .map(|i| {
            json!({
                "url": format!("{}/item/{}", server.uri(), i),
                "title": "T",
                "image": format!("{}/img/{}.png", server.uri(), i),
            })
        })
        .collect();

    let run = harness.run(&config, records).await?;
    assert_eq!(run.summary.total, 10);
    assert_eq!(run.summary.errored, 10);
    assert_eq!(run.summary.details.len(), 5);
    assert_eq!(run.summary.suppressed, 5);
    // The reporter still sees every outcome
    assert_eq!(run.outcomes.len(), 10);

    Ok(())
}

#[tokio::test]
async fn test_dead_host_retries_stay_within_log_limit() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(30)
        .mount(&server)
        .await;

    let harness = Harness::new(StoreFormat::All)?;
    let mut config = base_config();
    config.fetch.max_attempts = 3;
    config.log.limit = 5;

    let records = (0..10)
        .map(|i| {
            json!({
                "url": format!("{}/item/{}", server.uri(), i),
                "title": "T",
                "image": format!("{}/img/{}.png", server.uri(), i),
            })
        })
        .collect();

    let logs = CapturedLogs::default();
    let run = {
        let _guard = logs.warnings();
        harness.run(&config, records).await?
    };
    assert_eq!(run.summary.errored, 10);
    assert_eq!(run.summary.suppressed, 5);

    let lines = logs.lines();
    let failures = lines.iter().filter(|l| l.contains("Record errored")).count();
    assert_eq!(failures, 5);
    assert!(lines.iter().all(|l| !l.contains("retrying")), "{lines:#?}");
    // Detailed failures plus the one suppression notice
    assert!(lines.len() <= config.log.limit + 1, "{lines:#?}");

    Ok(())
}

#[tokio::test]
async fn test_cancellation_reports_queued_records_and_refuses_new_ones() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(png_bytes(10, 10))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(StoreFormat::All)?;
    let mut config = base_config();
    config.concurrency.workers = 1;
    config.concurrency.queue_capacity = 8;

    let (pipeline, reporter) = harness.pipeline(&config)?;
    let handle = pipeline.start();

    let record = |i: usize| {
        raw(json!({
            "url": format!("{}/item/{}", server.uri(), i),
            "title": "T",
            "image": format!("{}/img/{}.png", server.uri(), i),
        }))
    };

    handle.submit(record(0)).await?;
    // Let the single worker pick up the first record
    tokio::time::sleep(Duration::from_millis(200)).await;
    for i in 1..5 {
        handle.submit(record(i)).await?;
    }

    handle.cancel();
    assert!(matches!(
        handle.submit(record(5)).await,
        Err(SubmitError::Cancelled)
    ));

    let summary = handle.finish().await?;
    assert_eq!(summary.total, 5);
    assert_eq!(summary.cancelled, 5);
    assert_eq!(harness.store.mutations(), 0);

    let outcomes = reporter.outcomes().await;
    assert_eq!(outcomes.len(), 5);
    let never_started = outcomes
        .iter()
        .filter(|o| {
            o.status
                == OutcomeStatus::Errored {
                    stage: StageKind::FetchAssets,
                    cause: ErrorCause::Cancelled,
                }
        })
        .count();
    assert!(never_started >= 4);

    Ok(())
}

#[tokio::test]
async fn test_many_records_with_shared_image_fetch_concurrently() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    serve_png(&server, "/shared.png", png_bytes(80, 60)).await;

    let harness = Harness::new(StoreFormat::All)?;
    let mut config = base_config();
    config.concurrency.workers = 4;
    config.concurrency.queue_capacity = 2;

    let records = (0..25)
        .map(|i| {
            json!({
                "url": format!("{}/item/{}", server.uri(), i),
                "title": format!("Item {}", i),
                "image": format!("{}/shared.png", server.uri()),
            })
        })
        .collect();

    let run = harness.run(&config, records).await?;
    assert_eq!(run.summary.total, 25);
    assert_eq!(run.summary.inserted, 25);
    assert_eq!(harness.store.len().await, 25);

    // One content address for all 25 records
    let originals = std::fs::read_dir(harness.dir.path().join("full"))?.count();
    assert_eq!(originals, 1);

    Ok(())
}
