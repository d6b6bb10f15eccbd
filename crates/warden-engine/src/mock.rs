//! Scripted query engine for deterministic tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use warden_core::{EngineError, EngineEvent, EventStream, QueryEngine, QueryOptions};

/// One pre-programmed answer to `submit`.
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    /// Yield these items in order. An `Err` item ends the stream.
    Events(Vec<Result<EngineEvent, EngineError>>),
    /// Fail `submit` itself.
    Error(EngineError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<ScriptedResponse>),
    /// Yield the items with a pause before each one.
    Paced(Duration, Vec<Result<EngineEvent, EngineError>>),
}

impl ScriptedResponse {
    /// Text chunks followed by completion with `session_id`.
    pub fn text(chunks: &[&str], session_id: Option<&str>) -> Self {
        let mut items: Vec<_> = chunks.iter().map(|c| Ok(EngineEvent::text(*c))).collect();
        items.push(Ok(EngineEvent::completed(session_id)));
        Self::Events(items)
    }

    pub fn events(events: Vec<EngineEvent>) -> Self {
        Self::Events(events.into_iter().map(Ok).collect())
    }

    pub fn delayed(delay: Duration, inner: ScriptedResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Answers calls with scripted responses, in sequence.
#[derive(Default)]
pub struct ScriptedEngine {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    fallback: Option<ScriptedResponse>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    options: Mutex<Vec<QueryOptions>>,
    released: Mutex<Vec<String>>,
    release_error: Option<EngineError>,
}

impl ScriptedEngine {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// Response used once the scripted ones run out.
    pub fn with_fallback(mut self, response: ScriptedResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    /// Make every `release` call fail with `error`.
    pub fn failing_release(mut self, error: EngineError) -> Self {
        self.release_error = Some(error);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Options of every call, oldest first.
    pub fn recorded_options(&self) -> Vec<QueryOptions> {
        self.options.lock().clone()
    }

    pub fn last_options(&self) -> Option<QueryOptions> {
        self.options.lock().last().cloned()
    }

    /// Channels passed to `release`, in call order.
    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }
}

#[async_trait]
impl QueryEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, prompt: &str, options: &QueryOptions) -> Result<EventStream, EngineError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.prompts.lock().push(prompt.to_string());
        self.options.lock().push(options.clone());

        let next = self.responses.lock().pop_front();
        let Some(response) = next.or_else(|| self.fallback.clone()) else {
            return Err(EngineError::Unavailable(format!(
                "ScriptedEngine: no response configured for call {idx}"
            )));
        };
        resolve(response).await
    }

    async fn release(&self, channel_id: &str) -> Result<(), EngineError> {
        self.released.lock().push(channel_id.to_string());
        match &self.release_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Unrolls nested delays iteratively.
async fn resolve(response: ScriptedResponse) -> Result<EventStream, EngineError> {
    let mut current = response;
    loop {
        match current {
            ScriptedResponse::Events(items) => return Ok(Box::pin(stream::iter(items))),
            ScriptedResponse::Error(e) => return Err(e),
            ScriptedResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
            ScriptedResponse::Paced(pause, items) => {
                let stream = async_stream::stream! {
                    for item in items {
                        tokio::time::sleep(pause).await;
                        yield item;
                    }
                };
                return Ok(Box::pin(stream));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    async fn collect(stream: EventStream) -> Vec<Result<EngineEvent, EngineError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn responses_in_sequence() {
        let engine = ScriptedEngine::new(vec![
            ScriptedResponse::text(&["a", "b"], Some("s1")),
            ScriptedResponse::events(vec![EngineEvent::tool_use("Bash", json!({"command": "ls"}))]),
        ]);

        let first = collect(engine.submit("p1", &QueryOptions::default()).await.unwrap()).await;
        assert_eq!(
            first,
            vec![
                Ok(EngineEvent::text("a")),
                Ok(EngineEvent::text("b")),
                Ok(EngineEvent::completed(Some("s1"))),
            ]
        );

        let second = collect(engine.submit("p2", &QueryOptions::default()).await.unwrap()).await;
        assert_eq!(second.len(), 1);
        assert_eq!(engine.call_count(), 2);
        assert_eq!(engine.prompts(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn exhausted_script_is_unavailable() {
        let engine = ScriptedEngine::new(vec![]);
        let err = engine.submit("p", &QueryOptions::default()).await.err().unwrap();
        assert_eq!(err.error_kind(), "unavailable");
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn fallback_used_after_script() {
        let engine = ScriptedEngine::new(vec![]).with_fallback(ScriptedResponse::text(&["x"], None));
        for _ in 0..3 {
            let items = collect(engine.submit("p", &QueryOptions::default()).await.unwrap()).await;
            assert_eq!(items.len(), 2);
        }
    }

    #[tokio::test]
    async fn submit_error() {
        let engine = ScriptedEngine::new(vec![ScriptedResponse::Error(EngineError::Failed("nope".into()))]);
        let err = engine.submit("p", &QueryOptions::default()).await.err().unwrap();
        assert_eq!(err, EngineError::Failed("nope".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_waits_before_resolving() {
        let engine = ScriptedEngine::new(vec![ScriptedResponse::delayed(
            Duration::from_secs(5),
            ScriptedResponse::text(&[], None),
        )]);
        let start = tokio::time::Instant::now();
        let _ = engine.submit("p", &QueryOptions::default()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn paced_items_arrive_over_time() {
        let engine = ScriptedEngine::new(vec![ScriptedResponse::Paced(
            Duration::from_secs(1),
            vec![Ok(EngineEvent::text("a")), Ok(EngineEvent::completed(None))],
        )]);
        let start = tokio::time::Instant::now();
        let items = collect(engine.submit("p", &QueryOptions::default()).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn options_and_releases_recorded() {
        let engine = ScriptedEngine::new(vec![ScriptedResponse::text(&[], None)])
            .failing_release(EngineError::Failed("stuck".into()));
        let opts = QueryOptions {
            resume: Some("r1".into()),
            ..QueryOptions::default()
        };
        let _ = engine.submit("p", &opts).await.unwrap();
        assert_eq!(engine.last_options(), Some(opts));

        assert!(engine.release("C1").await.is_err());
        assert_eq!(engine.released(), vec!["C1"]);
    }
}
