//! Tests for property synchronization

mod common;

use common::{probe, request, response};
use edgetwin_core::envelope::ops;
use edgetwin_core::module::COMM_MODULE;
use edgetwin_core::{
    ContextConfig, DigitalTwin, PropertyModule, ResponseStatus, TwinContext, TwinError,
};
use serde_json::json;
use std::sync::Arc;

fn setup() -> (Arc<TwinContext>, PropertyModule, tokio::sync::mpsc::Receiver<edgetwin_core::Envelope>) {
    common::init_tracing();
    let ctx = TwinContext::new(ContextConfig::default());
    let mut property = PropertyModule::new();
    ctx.register_module(&mut property).unwrap();
    let comm_rx = probe(&ctx, COMM_MODULE);
    (ctx, property, comm_rx)
}

#[tokio::test]
async fn test_update_unknown_twin_responds_not_found() {
    let (ctx, property, mut comm_rx) = setup();

    let patch = DigitalTwin::new("ghost").with_desired("brightness", "80");
    property
        .dispatch(request(&ctx, ops::UPDATE, vec![patch]))
        .await
        .unwrap();

    let body = response(&comm_rx.try_recv().unwrap());
    assert_eq!(body.status, ResponseStatus::NotFound);
    assert!(!ctx.twin_exists("ghost"));
}

#[tokio::test]
async fn test_update_merges_desired_and_reported() {
    let (ctx, property, mut comm_rx) = setup();
    ctx.create_twin(
        DigitalTwin::new("d1")
            .with_desired("brightness", "10")
            .with_desired("color", "red")
            .with_reported("brightness", "10"),
    );

    let patch = DigitalTwin::new("d1")
        .with_desired("brightness", "80")
        .with_reported("temperature", json!(21.5));
    property
        .dispatch(request(&ctx, ops::UPDATE, vec![patch]))
        .await
        .unwrap();

    let twin = ctx.twin("d1").unwrap().unwrap();
    assert_eq!(twin.properties.desired["brightness"], "80");
    assert_eq!(twin.properties.desired["color"], "red");
    assert_eq!(twin.properties.reported["brightness"], "10");
    assert_eq!(twin.properties.reported["temperature"], json!(21.5));

    let body = response(&comm_rx.try_recv().unwrap());
    assert_eq!(body.status, ResponseStatus::Success);
    assert_eq!(body.twins[0].properties.desired["brightness"], "80");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_disjoint_keys_both_survive() {
    let ctx = TwinContext::new(ContextConfig::default());
    ctx.create_twin(DigitalTwin::new("d1"));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let ctx = Arc::clone(&ctx);
        tasks.push(tokio::spawn(async move {
            let patch = DigitalTwin::new("d1").with_desired(format!("key{i}"), i);
            ctx.update_twin("d1", |twin| twin.properties.merge(&patch.properties))
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let twin = ctx.twin("d1").unwrap().unwrap();
    assert_eq!(twin.properties.desired.len(), 16);
}

#[tokio::test]
async fn test_same_key_keeps_last_applied_value() {
    let (ctx, property, _comm_rx) = setup();
    ctx.create_twin(DigitalTwin::new("d1"));

    for value in ["1", "2", "3"] {
        let patch = DigitalTwin::new("d1").with_desired("level", value);
        property
            .dispatch(request(&ctx, ops::UPDATE, vec![patch]))
            .await
            .unwrap();
    }

    assert_eq!(ctx.twin("d1").unwrap().unwrap().properties.desired["level"], "3");
}

#[tokio::test]
async fn test_extension_operations_are_not_implemented() {
    let (ctx, property, mut comm_rx) = setup();

    for op in [ops::DELETE, ops::GET, ops::WATCH, ops::SYNC] {
        let err = property
            .dispatch(request(&ctx, op, vec![DigitalTwin::new("d1")]))
            .await
            .unwrap_err();
        assert!(matches!(err, TwinError::NotImplemented(_)), "{op}: {err}");
    }

    let err = property
        .dispatch(request(&ctx, "Teleport", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, TwinError::UnknownOperation(_)));
    assert!(comm_rx.try_recv().is_err());
}
