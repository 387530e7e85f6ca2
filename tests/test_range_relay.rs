//! Integration tests for RangeRelay
//!
//! The upstream audio host is a wiremock server that honours Range headers
//! and the extractor is a scripted CommandRunner pointing at it.

mod common;

use audio_relay::{CommandOutput, RelayBody, RelayError};
use common::*;
use http::StatusCode;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn upstream_with(data: Vec<u8>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/audio"))
        .respond_with(RangeResponder::new(data))
        .mount(&server)
        .await;
    server
}

async fn upstream_gets(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == "/audio")
        .count()
}

// ============================================================================
// First contact
// ============================================================================

#[tokio::test]
async fn test_first_contact_serves_initial_chunk() {
    let data = resource(10_000);
    let server = upstream_with(data.clone()).await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 10_000)]);
    let relay = test_relay(runner);

    let response = relay.serve(VIDEO_ID, None).await.unwrap();
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.content_range.as_deref(), Some("bytes 0-1999/10000"));
    assert_eq!(response.content_length, 2000);
    assert_eq!(response.content_type, "audio/webm");

    let body = response.into_bytes().await;
    assert_eq!(body.as_ref(), &data[..2000]);

    // The whole read-ahead window lands in the buffer
    wait_for_fill(&relay, VIDEO_ID).await;
    let buffer = relay.registry().get(VIDEO_ID).unwrap();
    assert!(buffer.covers(0, 2999));
    assert!(!buffer.covers(0, 3000));
}

#[tokio::test]
async fn test_first_contact_small_resource_is_200() {
    let data = resource(1500);
    let server = upstream_with(data.clone()).await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 1500)]);
    let relay = test_relay(runner);

    let response = relay.serve(VIDEO_ID, None).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.content_range.is_none());
    assert_eq!(response.content_length, 1500);
    assert_eq!(response.into_bytes().await.as_ref(), data.as_slice());
}

// ============================================================================
// Hit / miss
// ============================================================================

#[tokio::test]
async fn test_range_inside_window_is_served_from_memory() {
    let data = resource(3000);
    let server = upstream_with(data.clone()).await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 3000)]);
    let relay = test_relay(runner);

    relay.serve(VIDEO_ID, None).await.unwrap().into_bytes().await;
    wait_for_fill(&relay, VIDEO_ID).await;
    assert_eq!(upstream_gets(&server).await, 1);

    // Window is [0, 2999]
    let response = relay.serve(VIDEO_ID, Some("bytes=1000-1999")).await.unwrap();
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.content_range.as_deref(), Some("bytes 1000-1999/3000"));
    assert!(matches!(response.body, RelayBody::Full(_)));
    let body = response.into_bytes().await;
    assert_eq!(body.len(), 1000);
    assert_eq!(body.as_ref(), &data[1000..2000]);

    assert_eq!(upstream_gets(&server).await, 1, "hit must not touch upstream");
    let stats = relay.metrics().get_stats();
    assert_eq!(stats.buffer_hits, 1);
    assert_eq!(stats.buffer_misses, 1);
}

#[tokio::test]
async fn test_seek_outside_window_resets_buffer() {
    let data = resource(20_000);
    let server = upstream_with(data.clone()).await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 20_000)]);
    let relay = test_relay(runner);

    relay.serve(VIDEO_ID, None).await.unwrap().into_bytes().await;
    wait_for_fill(&relay, VIDEO_ID).await;

    let response = relay.serve(VIDEO_ID, Some("bytes=10000-10499")).await.unwrap();
    assert_eq!(response.into_bytes().await.as_ref(), &data[10_000..10_500]);
    wait_for_fill(&relay, VIDEO_ID).await;

    let buffer = relay.registry().get(VIDEO_ID).unwrap();
    assert!(!buffer.covers(0, 0), "old window discarded");
    assert_eq!(buffer.snapshot().window_start, 10_000);
    assert!(buffer.covers(10_000, 12_999));
    assert_eq!(relay.metrics().get_stats().buffer_resets, 1);
}

#[tokio::test]
async fn test_contiguous_miss_extends_window() {
    let data = resource(20_000);
    let server = upstream_with(data.clone()).await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 20_000)]);
    let relay = test_relay(runner);

    relay.serve(VIDEO_ID, None).await.unwrap().into_bytes().await;
    wait_for_fill(&relay, VIDEO_ID).await;

    // Starts inside [0, 2999] but ends past it
    let response = relay.serve(VIDEO_ID, Some("bytes=2500-3499")).await.unwrap();
    assert_eq!(response.into_bytes().await.as_ref(), &data[2500..3500]);
    wait_for_fill(&relay, VIDEO_ID).await;

    let buffer = relay.registry().get(VIDEO_ID).unwrap();
    assert!(buffer.covers(0, 5499));
    assert_eq!(buffer.slice(0, 5499).unwrap().as_ref(), &data[..5500]);
    assert_eq!(relay.metrics().get_stats().buffer_resets, 0);
}

#[tokio::test]
async fn test_low_water_hit_schedules_read_ahead() {
    let data = resource(20_000);
    let server = upstream_with(data.clone()).await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 20_000)]);
    let relay = test_relay(runner);

    relay.serve(VIDEO_ID, None).await.unwrap().into_bytes().await;
    wait_for_fill(&relay, VIDEO_ID).await;

    // Ends at the window end: nothing buffered past it
    let response = relay.serve(VIDEO_ID, Some("bytes=2000-2999")).await.unwrap();
    assert_eq!(response.into_bytes().await.as_ref(), &data[2000..3000]);
    wait_for_fill(&relay, VIDEO_ID).await;

    let buffer = relay.registry().get(VIDEO_ID).unwrap();
    assert!(buffer.covers(0, 5999));
    assert_eq!(buffer.slice(3000, 5999).unwrap().as_ref(), &data[3000..6000]);

    let stats = relay.metrics().get_stats();
    assert_eq!(stats.read_aheads_started, 1);
    assert_eq!(stats.read_aheads_failed, 0);
    assert_eq!(upstream_gets(&server).await, 2);
}

#[tokio::test]
async fn test_failed_read_ahead_is_swallowed() {
    let data = resource(20_000);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/audio"))
        .and(header("range", "bytes=3000-5999"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/audio"))
        .respond_with(RangeResponder::new(data.clone()))
        .mount(&server)
        .await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 20_000)]);
    let relay = test_relay(runner);

    relay.serve(VIDEO_ID, None).await.unwrap().into_bytes().await;
    wait_for_fill(&relay, VIDEO_ID).await;

    // The hit is answered in full even though the read-ahead it starts fails
    let response = relay.serve(VIDEO_ID, Some("bytes=2000-2999")).await.unwrap();
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.content_range.as_deref(), Some("bytes 2000-2999/20000"));
    assert_eq!(response.into_bytes().await.as_ref(), &data[2000..3000]);
    wait_for_fill(&relay, VIDEO_ID).await;

    let buffer = relay.registry().get(VIDEO_ID).unwrap();
    assert!(!buffer.is_filling());
    assert!(buffer.covers(0, 2999));
    assert!(!buffer.covers(3000, 3000));

    let stats = relay.metrics().get_stats();
    assert_eq!(stats.read_aheads_started, 1);
    assert_eq!(stats.read_aheads_failed, 1);
    assert_eq!(stats.failed_requests, 0);
}

#[tokio::test]
async fn test_seek_during_streaming_miss() {
    let data = resource(20_000);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/audio"))
        .respond_with(RangeResponder::with_delay(data.clone(), Duration::from_millis(200)))
        .mount(&server)
        .await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 20_000)]);
    let relay = test_relay(runner);

    let first = {
        let relay = relay.clone();
        tokio::spawn(async move {
            let response = relay.serve(VIDEO_ID, Some("bytes=0-1999")).await.unwrap();
            response.into_bytes().await
        })
    };

    // Wait until the first miss owns the buffer, then seek away from it
    for _ in 0..100 {
        let filling = relay
            .registry()
            .get(VIDEO_ID)
            .map(|buffer| buffer.is_filling())
            .unwrap_or(false);
        if filling {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let second = async {
        let response = relay.serve(VIDEO_ID, Some("bytes=10000-10499")).await.unwrap();
        response.into_bytes().await
    };

    let (first_body, second_body) = tokio::join!(first, second);
    assert_eq!(first_body.unwrap().as_ref(), &data[..2000]);
    assert_eq!(second_body.as_ref(), &data[10_000..10_500]);

    wait_for_fill(&relay, VIDEO_ID).await;
    let buffer = relay.registry().get(VIDEO_ID).unwrap();
    assert_eq!(buffer.snapshot().window_start, 10_000);
    assert!(!buffer.covers(0, 0));
    assert_eq!(buffer.slice(10_000, 12_999).unwrap().as_ref(), &data[10_000..13_000]);
}

#[tokio::test]
async fn test_open_ended_range_is_clamped_to_fetch_window() {
    let data = resource(20_000);
    let server = upstream_with(data.clone()).await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 20_000)]);
    let relay = test_relay(runner);

    let response = relay.serve(VIDEO_ID, Some("bytes=100-")).await.unwrap();
    assert_eq!(response.content_range.as_deref(), Some("bytes 100-3099/20000"));
    assert_eq!(response.content_length, 3000);
    assert_eq!(response.into_bytes().await.as_ref(), &data[100..3100]);
}

#[tokio::test]
async fn test_head_does_not_fetch_upstream() {
    let server = upstream_with(resource(20_000)).await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 20_000)]);
    let relay = test_relay(runner);

    let response = relay.head(VIDEO_ID, Some("bytes=0-99")).await.unwrap();
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.content_length, 100);
    assert!(response.into_bytes().await.is_empty());
    assert_eq!(upstream_gets(&server).await, 0);
}

// ============================================================================
// Link expiry
// ============================================================================

#[tokio::test]
async fn test_forbidden_triggers_one_reresolve() {
    let data = resource(5000);
    let server = upstream_with(data.clone()).await;
    Mock::given(path("/expired"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let runner = ScriptedRunner::new(vec![
        single_format(&format!("{}/expired", server.uri()), 5000),
        single_format(&format!("{}/audio", server.uri()), 5000),
    ]);
    let relay = test_relay(runner.clone());

    let response = relay.serve(VIDEO_ID, Some("bytes=0-99")).await.unwrap();
    assert_eq!(response.into_bytes().await.as_ref(), &data[..100]);

    assert_eq!(runner.calls(), 2);
    let stats = relay.metrics().get_stats();
    assert_eq!(stats.reresolutions, 1);
    assert_eq!(stats.upstream_fetches, 2);
    assert_eq!(stats.upstream_failures, 1);
    assert!(relay
        .resolver()
        .cached(VIDEO_ID)
        .unwrap()
        .source_url
        .ends_with("/audio"));
}

#[tokio::test]
async fn test_second_forbidden_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(path("/expired"))
        .respond_with(ResponseTemplate::new(403))
        .expect(2)
        .mount(&server)
        .await;

    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/expired", server.uri()), 5000)]);
    let relay = test_relay(runner.clone());

    let err = relay.serve(VIDEO_ID, Some("bytes=0-99")).await.unwrap_err();
    assert_eq!(err, RelayError::UpstreamForbidden { status: 403 });
    assert_eq!(err.to_http_status(), 502);
    assert_eq!(runner.calls(), 2);

    let buffer = relay.registry().get(VIDEO_ID).unwrap();
    assert!(!buffer.is_filling(), "failed fill is released");
}

#[tokio::test]
async fn test_other_upstream_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/broken", server.uri()), 5000)]);
    let relay = test_relay(runner.clone());

    let err = relay.serve(VIDEO_ID, Some("bytes=0-99")).await.unwrap_err();
    assert_eq!(err, RelayError::UpstreamStatus { status: 500 });
    assert_eq!(err.to_http_status(), 502);
    assert_eq!(runner.calls(), 1);
}

// ============================================================================
// Rejections
// ============================================================================

#[tokio::test]
async fn test_unsatisfiable_ranges_are_416() {
    let server = upstream_with(resource(5000)).await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 5000)]);
    let relay = test_relay(runner);

    for header in ["bytes=5000-", "bytes=0-5000", "bytes=300-200", "items=0-1"] {
        let err = relay.serve(VIDEO_ID, Some(header)).await.unwrap_err();
        assert_eq!(err.to_http_status(), 416, "{}", header);
    }
    assert_eq!(upstream_gets(&server).await, 0);
}

#[tokio::test]
async fn test_invalid_identifier_is_400_without_resolution() {
    let runner = ScriptedRunner::new(vec![single_format("http://127.0.0.1:1/audio", 5000)]);
    let relay = test_relay(runner.clone());

    for id in ["short", "../etc/pass", "dQw4w9WgXc Q", "dQw4w9WgXcQQ"] {
        let err = relay.serve(id, None).await.unwrap_err();
        assert_eq!(err.to_http_status(), 400, "{}", id);
    }
    assert_eq!(runner.calls(), 0);
    assert!(relay.registry().is_empty());
}

#[tokio::test]
async fn test_extractor_failure_is_502() {
    let runner = ScriptedRunner::new(vec![CommandOutput {
        exit_code: Some(1),
        stdout: Vec::new(),
        stderr: b"ERROR: Video unavailable".to_vec(),
    }]);
    let relay = test_relay(runner);

    let err = relay.serve(VIDEO_ID, None).await.unwrap_err();
    assert!(matches!(err, RelayError::ExtractionFailed { exit_code: Some(1), .. }));
    assert_eq!(err.to_http_status(), 502);
    assert_eq!(relay.metrics().get_stats().failed_requests, 1);
}

#[tokio::test]
async fn test_shutdown_releases_buffers() {
    let server = upstream_with(resource(3000)).await;
    let runner = ScriptedRunner::new(vec![single_format(&format!("{}/audio", server.uri()), 3000)]);
    let relay = test_relay(runner);
    relay.start();

    relay.serve(VIDEO_ID, None).await.unwrap().into_bytes().await;
    wait_for_fill(&relay, VIDEO_ID).await;
    let buffer = relay.registry().get(VIDEO_ID).unwrap();

    relay.shutdown();
    assert!(buffer.is_destroyed());
    assert!(relay.registry().is_empty());
}
