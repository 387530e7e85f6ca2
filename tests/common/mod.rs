//! Shared fixtures: a scripted extractor and a range-honouring upstream

#![allow(dead_code)]

use async_trait::async_trait;
use audio_relay::{CommandOutput, CommandRunner, RangeRelay, RelayConfig, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::{Request, Respond, ResponseTemplate};

pub const VIDEO_ID: &str = "dQw4w9WgXcQ";

/// Deterministic resource content
pub fn resource(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Extractor that replays scripted outputs; the last one repeats
pub struct ScriptedRunner {
    outputs: Mutex<VecDeque<CommandOutput>>,
    last: Mutex<Option<CommandOutput>>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new(outputs: Vec<CommandOutput>) -> Arc<Self> {
        Self::with_delay(outputs, Duration::ZERO)
    }

    pub fn with_delay(outputs: Vec<CommandOutput>, delay: Duration) -> Arc<Self> {
        Arc::new(ScriptedRunner {
            outputs: Mutex::new(outputs.into()),
            last: Mutex::new(None),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, _program: &str, _args: &[String]) -> Result<CommandOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.outputs.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(output) => {
                *last = Some(output.clone());
                Ok(output)
            }
            None => Ok(last.clone().unwrap_or_default()),
        }
    }
}

/// Successful extractor run printing `json`
pub fn extractor_json(json: String) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: json.into_bytes(),
        stderr: Vec::new(),
    }
}

/// Extractor output with one audio-only webm format at `url`
pub fn single_format(url: &str, size: u64) -> CommandOutput {
    extractor_json(format!(
        r#"{{"id":"{}","formats":[
            {{"format_id":"18","url":"{}/muxed","vcodec":"avc1","acodec":"mp4a","abr":96,"filesize":{},"ext":"mp4"}},
            {{"format_id":"251","url":"{}","vcodec":"none","acodec":"opus","abr":160,"filesize":{},"ext":"webm",
              "http_headers":{{"User-Agent":"relay-test/1.0"}}}}
        ]}}"#,
        VIDEO_ID, url, size, url, size
    ))
}

/// Upstream that answers Range requests from an in-memory resource
pub struct RangeResponder {
    data: Arc<Vec<u8>>,
    delay: Duration,
}

impl RangeResponder {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_delay(data, Duration::ZERO)
    }

    /// Hold every response back by `delay`
    pub fn with_delay(data: Vec<u8>, delay: Duration) -> Self {
        RangeResponder {
            data: Arc::new(data),
            delay,
        }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.data.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes="))
            .and_then(|value| value.split_once('-'))
            .and_then(|(start, end)| Some((start.parse::<u64>().ok()?, end.parse::<u64>().ok()?)));

        let template = match range {
            Some((start, end)) if start < total => {
                let end = end.min(total - 1);
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, total).as_str())
                    .set_body_bytes(self.data[start as usize..=end as usize].to_vec())
            }
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200).set_body_bytes(self.data.as_ref().clone()),
        };
        template.set_delay(self.delay)
    }
}

/// Small windows so tests exercise trimming and read-ahead with kilobytes
pub fn test_config() -> RelayConfig {
    RelayConfig {
        initial_chunk_bytes: 2000,
        read_ahead_bytes: 3000,
        max_buffer_bytes: 10_000,
        low_water_bytes: 1000,
        upstream_timeout_secs: 5,
        ..RelayConfig::default()
    }
}

pub fn test_relay(runner: Arc<ScriptedRunner>) -> RangeRelay {
    RangeRelay::new(test_config(), runner).unwrap()
}

/// Wait until the buffer for `id` has no fill running
pub async fn wait_for_fill(relay: &RangeRelay, id: &str) {
    for _ in 0..500 {
        match relay.registry().get(id) {
            Some(buffer) if buffer.is_filling() => {}
            _ => return,
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("fill for {} did not finish", id);
}
