//! End-to-end tests for the websocket generation endpoints.

mod common;

use std::time::Duration;

use common::{authorized, connect, png_data_url, run_to_end, send_json, spawn_server, FakeModel, Outcome};
use flue_core::ScheduleError;
use futures::SinkExt;
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

const POLICY: u16 = 1008;

fn policy(reason: impl Into<String>) -> Outcome {
    Outcome::Closed {
        code: POLICY,
        reason: reason.into(),
    }
}

#[tokio::test]
async fn wrong_password_closes_with_authorization_error() {
    let addr = spawn_server(FakeModel::new(8)).await;
    let mut client = connect(addr, "/text_to_image").await;
    send_json(&mut client, json!({"username": "ada", "password": "nope"})).await;

    let (progress, outcome) = run_to_end(&mut client).await;
    assert!(progress.is_empty());
    assert_eq!(outcome, policy("Authorization error"));
}

#[tokio::test]
async fn batched_request_streams_progress_then_all_images() {
    let model = FakeModel::new(8);
    let calls = model.calls.clone();
    let addr = spawn_server(model).await;
    let mut client = authorized(addr, "/text_to_image").await;
    send_json(
        &mut client,
        json!({
            "prompt": "a lighthouse",
            "seed": 42,
            "num_variants": 10,
            "batch_size": 4,
            "num_inference_steps": 4,
        }),
    )
    .await;

    let (progress, outcome) = run_to_end(&mut client).await;
    assert_eq!(progress.len(), 12);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|p| (0.0..1.0).contains(p)));

    let Outcome::Finished(result) = outcome else {
        panic!("expected finished, got {outcome:?}");
    };
    let images = result["images"].as_array().unwrap();
    assert_eq!(images.len(), 10);
    assert!(images
        .iter()
        .all(|image| image.as_str().unwrap().starts_with("data:image/png;base64,")));

    let calls = calls.lock().unwrap();
    let sizes: Vec<_> = calls.iter().map(|call| call.num_images).collect();
    let seeds: Vec<_> = calls.iter().map(|call| call.seed).collect();
    assert_eq!(sizes, [4, 4, 2]);
    assert_eq!(seeds, [Some(42), Some(46), Some(50)]);
}

#[tokio::test]
async fn oversized_batch_without_retry_is_reported() {
    let addr = spawn_server(FakeModel::new(2)).await;
    let mut client = authorized(addr, "/text_to_image").await;
    send_json(
        &mut client,
        json!({
            "prompt": "a lighthouse",
            "num_variants": 5,
            "batch_size": 5,
            "try_smaller_batch_on_fail": false,
        }),
    )
    .await;

    let (_, outcome) = run_to_end(&mut client).await;
    assert_eq!(outcome, policy(ScheduleError::BatchSizeTooLarge(5).to_string()));
}

#[tokio::test]
async fn retry_falls_back_to_smaller_batches() {
    let model = FakeModel::new(2);
    let calls = model.calls.clone();
    let addr = spawn_server(model).await;
    let mut client = authorized(addr, "/text_to_image").await;
    send_json(
        &mut client,
        json!({"prompt": "a lighthouse", "num_variants": 5, "batch_size": 4}),
    )
    .await;

    let (_, outcome) = run_to_end(&mut client).await;
    let Outcome::Finished(result) = outcome else {
        panic!("expected finished, got {outcome:?}");
    };
    assert_eq!(result["images"].as_array().unwrap().len(), 5);

    let sizes: Vec<_> = calls.lock().unwrap().iter().map(|call| call.num_images).collect();
    assert_eq!(sizes, [4, 3, 2, 2, 1]);
}

#[tokio::test]
async fn nothing_fits_is_infeasible() {
    let addr = spawn_server(FakeModel::new(0)).await;
    let mut client = authorized(addr, "/text_to_image").await;
    send_json(
        &mut client,
        json!({"prompt": "a lighthouse", "num_variants": 3, "batch_size": 3}),
    )
    .await;

    let (_, outcome) = run_to_end(&mut client).await;
    assert_eq!(outcome, policy(ScheduleError::InfeasibleConfiguration.to_string()));
}

#[tokio::test]
async fn non_json_request_is_a_protocol_error() {
    let addr = spawn_server(FakeModel::new(8)).await;
    let mut client = authorized(addr, "/text_to_image").await;
    client
        .send(Message::Text("draw me a sheep".into()))
        .await
        .unwrap();

    let (_, outcome) = run_to_end(&mut client).await;
    assert_eq!(
        outcome,
        policy("Server received message that is not in json format")
    );
}

#[tokio::test]
async fn non_json_handshake_is_a_protocol_error() {
    let addr = spawn_server(FakeModel::new(8)).await;
    let mut client = connect(addr, "/image_to_image").await;
    client.send(Message::Text("ada:secret".into())).await.unwrap();

    let (_, outcome) = run_to_end(&mut client).await;
    assert_eq!(
        outcome,
        policy("Server received message that is not in json format")
    );
}

#[tokio::test]
async fn invalid_fields_close_with_the_validation_message() {
    let model = FakeModel::new(8);
    let calls = model.calls.clone();
    let addr = spawn_server(model).await;
    let mut client = authorized(addr, "/text_to_image").await;
    send_json(&mut client, json!({"prompt": "a lighthouse", "num_variants": 0})).await;

    let (_, outcome) = run_to_end(&mut client).await;
    assert_eq!(outcome, policy("num_variants must be at least 1"));
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_prompt_is_a_validation_error() {
    let addr = spawn_server(FakeModel::new(8)).await;
    let mut client = authorized(addr, "/text_to_image").await;
    send_json(&mut client, json!({"num_variants": 2})).await;

    let (_, outcome) = run_to_end(&mut client).await;
    let Outcome::Closed { code, reason } = outcome else {
        panic!("expected close, got {outcome:?}");
    };
    assert_eq!(code, POLICY);
    assert!(reason.contains("prompt"), "{reason}");
}

#[tokio::test]
async fn disconnect_mid_request_releases_the_model() {
    let model = FakeModel::new(8).with_step_delay(Duration::from_millis(20));
    let calls = model.calls.clone();
    let addr = spawn_server(model).await;

    let mut leaving = authorized(addr, "/text_to_image").await;
    send_json(
        &mut leaving,
        json!({
            "prompt": "a lighthouse",
            "num_variants": 4,
            "batch_size": 1,
            "num_inference_steps": 50,
        }),
    )
    .await;
    loop {
        match futures::StreamExt::next(&mut leaving).await {
            Some(Ok(Message::Text(_))) => break,
            Some(Ok(_)) => continue,
            other => panic!("session ended early: {other:?}"),
        }
    }
    drop(leaving);

    let mut next = authorized(addr, "/text_to_image").await;
    send_json(
        &mut next,
        json!({"prompt": "a harbor", "num_inference_steps": 2}),
    )
    .await;
    let (_, outcome) = run_to_end(&mut next).await;
    let Outcome::Finished(result) = outcome else {
        panic!("expected finished, got {outcome:?}");
    };
    assert_eq!(result["images"].as_array().unwrap().len(), 1);

    // The abandoned request never reached its second image.
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
}

#[tokio::test]
async fn inpainting_combines_alpha_into_the_mask() {
    let model = FakeModel::new(8);
    let calls = model.calls.clone();
    let addr = spawn_server(model).await;

    let mut source = RgbaImage::from_pixel(64, 64, Rgba([10, 20, 30, 255]));
    source.put_pixel(5, 5, Rgba([0, 0, 0, 0]));
    let source = png_data_url(&DynamicImage::ImageRgba8(source));

    let mut client = authorized(addr, "/inpainting").await;
    send_json(
        &mut client,
        json!({"prompt": "a boat", "source_image": source, "num_variants": 2, "batch_size": 2}),
    )
    .await;

    let (_, outcome) = run_to_end(&mut client).await;
    let Outcome::Finished(result) = outcome else {
        panic!("expected finished, got {outcome:?}");
    };
    assert_eq!(result["images"].as_array().unwrap().len(), 2);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].masked);
}

#[tokio::test]
async fn extreme_aspect_ratio_closes_with_a_validation_error() {
    let model = FakeModel::new(8);
    let calls = model.calls.clone();
    let addr = spawn_server(model).await;
    let mut client = authorized(addr, "/text_to_image").await;
    send_json(&mut client, json!({"prompt": "a lighthouse", "aspect_ratio": 1e300})).await;

    let (_, outcome) = run_to_end(&mut client).await;
    let Outcome::Closed { code, reason } = outcome else {
        panic!("expected close, got {outcome:?}");
    };
    assert_eq!(code, POLICY);
    assert!(reason.contains("aspect_ratio"), "{reason}");
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn very_tall_source_closes_with_a_validation_error() {
    let addr = spawn_server(FakeModel::new(8)).await;
    let source = png_data_url(&DynamicImage::new_rgb8(1, 20_000));
    let mut client = authorized(addr, "/image_to_image").await;
    send_json(&mut client, json!({"prompt": "a boat", "source_image": source})).await;

    let (_, outcome) = run_to_end(&mut client).await;
    let Outcome::Closed { code, .. } = outcome else {
        panic!("expected close, got {outcome:?}");
    };
    assert_eq!(code, POLICY);
}

#[tokio::test]
async fn image_to_image_rejects_undecodable_source() {
    let addr = spawn_server(FakeModel::new(8)).await;
    let mut client = authorized(addr, "/image_to_image").await;
    send_json(
        &mut client,
        json!({"prompt": "a boat", "source_image": "not base64!"}),
    )
    .await;

    let (_, outcome) = run_to_end(&mut client).await;
    assert_eq!(outcome, policy("image is not valid base64"));
}

#[tokio::test]
async fn gobig_returns_one_refined_image_at_the_target_size() {
    let model = FakeModel::new(1);
    let calls = model.calls.clone();
    let addr = spawn_server(model).await;

    let source = png_data_url(&DynamicImage::new_rgb8(32, 32));
    let mut client = authorized(addr, "/gobig").await;
    send_json(
        &mut client,
        json!({
            "prompt": "a harbor",
            "seed": 7,
            "image": source,
            "target_width": 128,
            "target_height": 96,
            "num_inference_steps": 2,
        }),
    )
    .await;

    let (progress, outcome) = run_to_end(&mut client).await;
    assert!(!progress.is_empty());
    let Outcome::Finished(result) = outcome else {
        panic!("expected finished, got {outcome:?}");
    };
    let image = flue_server::transport::decode_image(result["image"].as_str().unwrap()).unwrap();
    assert_eq!((image.width(), image.height()), (128, 96));
    assert_eq!(calls.lock().unwrap()[0].seed, Some(7));
}
