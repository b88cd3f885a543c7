//! Streaming delivery, event-queue overflow and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{script_edit, script_intent, script_review, script_single_step_plan, Fixture, MAIN_RS};
use conductor::adapters::providers::{ScriptedFailure, ScriptedProvider, ScriptedReply};
use conductor::adapters::sinks::RecordingEventSink;
use conductor::domain::models::{Phase, PipelineEvent, StageId};
use conductor::ErrorKind;
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn script_request(fixture: &Fixture) {
    script_intent(&fixture.provider, 0.9).await;
    script_single_step_plan(&fixture.provider).await;
    script_edit(
        &fixture.provider,
        "let config = load_config();",
        "let config = load_config().unwrap_or_default();",
    )
    .await;
    script_review(&fixture.provider, json!([])).await;
}

fn streaming_fixture(chunk_chars: usize, delay: Duration) -> Fixture {
    let mut fixture = Fixture::with_provider(ScriptedProvider::new().with_streaming(chunk_chars, delay));
    fixture.config.execution.streaming = true;
    fixture
}

#[tokio::test]
async fn test_streamed_content_reassembles_provider_output() {
    let fixture = streaming_fixture(6, Duration::ZERO);
    script_request(&fixture).await;

    let events = Arc::new(RecordingEventSink::new());
    let result = fixture
        .conductor(events.clone())
        .run("handle config load failures", None, CancellationToken::new())
        .await;

    assert!(result.is_completed(), "{:?}", result.outcome);
    assert_eq!(result.metrics.dropped_stream_events, 0);

    let raw = fixture.provider.requests(StageId::Execution).await;
    assert_eq!(raw.len(), 1);
    let streamed = events.content();
    assert!(streamed.contains("unwrap_or_default"));
    let parsed: serde_json::Value = serde_json::from_str(&streamed).expect("stream is the full output");
    assert_eq!(parsed["edit"]["kind"], "replace");

    let sequences: Vec<u64> = events
        .events()
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::ContentChunk { sequence, step_id, .. } => {
                assert_eq!(step_id, "fix-main");
                Some(*sequence)
            }
            _ => None,
        })
        .collect();
    assert!(sequences.len() > 1);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_slow_consumer_drops_events_without_failing() {
    let mut fixture = streaming_fixture(1, Duration::ZERO);
    fixture.config.streaming.queue_capacity = 1;
    script_request(&fixture).await;

    let result = fixture
        .conductor(Arc::new(RecordingEventSink::new()))
        .run("handle config load failures", None, CancellationToken::new())
        .await;

    assert!(result.is_completed(), "{:?}", result.outcome);
    assert!(result.metrics.dropped_stream_events > 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_stream_discards_partial_output() {
    let fixture = streaming_fixture(1, Duration::from_millis(50));
    script_request(&fixture).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });

    let events = Arc::new(RecordingEventSink::new());
    let result = fixture
        .conductor(events.clone())
        .run("handle config load failures", None, cancel)
        .await;

    let error = result.outcome.error().expect("request should be cancelled");
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert!(result.outcome.artifacts().is_empty());
    assert_eq!(result.final_phase, Phase::Failed);
    assert_eq!(fixture.provider.calls(StageId::Validation).await, 0);
    assert!(fixture.repository.written().await.is_empty());
    assert_eq!(fixture.repository.get("src/main.rs").await.as_deref(), Some(MAIN_RS));

    let streamed = events.content();
    assert!(!streamed.is_empty());
    assert!(serde_json::from_str::<serde_json::Value>(&streamed).is_err());
    assert!(matches!(
        events.events().last(),
        Some(PipelineEvent::Finished { outcome, .. }) if outcome == "failed"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_retrying() {
    let mut fixture = Fixture::new();
    fixture.config.retry.initial_backoff_ms = 10_000;
    fixture.config.retry.max_backoff_ms = 60_000;
    script_intent(&fixture.provider, 0.9).await;
    fixture
        .provider
        .push(StageId::Plan, ScriptedReply::failure(ScriptedFailure::Timeout))
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = fixture
        .conductor(Arc::new(RecordingEventSink::new()))
        .run("handle config load failures", None, cancel)
        .await;

    assert_eq!(result.outcome.error().map(|e| e.kind), Some(ErrorKind::Cancelled));
    assert_eq!(fixture.provider.calls(StageId::Plan).await, 1);
    assert!(started.elapsed() < Duration::from_millis(10_000));
}

#[tokio::test]
async fn test_concurrent_requests_are_isolated() {
    let fixture = Arc::new(Fixture::new());
    script_request(&fixture).await;

    let handles: Vec<_> = (0..4).map(|n| {
        let fixture = fixture.clone();
        tokio::spawn(async move {
            let events = Arc::new(RecordingEventSink::new());
            let result = fixture
                .conductor(events.clone())
                .run(&format!("handle config load failures {n}"), None, CancellationToken::new())
                .await;
            (result, events)
        })
    }).collect();

    let results: Vec<_> = futures::future::join_all(handles).await;
    let mut ids = Vec::new();
    for joined in results {
        let (result, events) = joined.expect("request task");
        assert!(result.is_completed(), "{:?}", result.outcome);
        assert!(events.events().iter().all(|e| e.request_id() == result.request_id));
        ids.push(result.request_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}
