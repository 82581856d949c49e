//! Runs blocking generations on a worker pool and hands their output back to
//! async request handlers.

mod channel;
mod invoker;
mod pool;

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde_json::Value;
use uuid::Uuid;

pub use pool::{PoolStats, WorkerPool};

use channel::{emission_channel, Emission, EmissionReceiver, Mode};
use invoker::WorkerTask;

use crate::model::{ChatMessage, ModelCapability};
use crate::params::{sanitize, GenerationParameters};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Failed(String),
    #[error("generation task broke the channel protocol")]
    Protocol,
}

pub type FragmentStream =
    Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

pub struct Bridge {
    model: Arc<dyn ModelCapability>,
    pool: WorkerPool,
    defaults: GenerationParameters,
}

impl Bridge {
    pub fn new(
        model: Arc<dyn ModelCapability>,
        pool: WorkerPool,
        defaults: GenerationParameters,
    ) -> Self {
        Self { model, pool, defaults }
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Waits for queued and running generations, then stops the workers.
    pub fn shutdown(self) {
        self.pool.shutdown();
    }

    /// Generates a complete reply. `payload` carries the optional sampling
    /// overrides of the request body.
    pub async fn infer(
        &self,
        messages: Vec<ChatMessage>,
        payload: &Value,
    ) -> Result<String, GenerationError> {
        let mut rx = self.dispatch(messages, payload, Mode::Unary);
        match rx.recv().await {
            Some(Emission::Complete(text)) => Ok(text),
            Some(Emission::Failed(cause)) => Err(GenerationError::Failed(cause)),
            _ => Err(GenerationError::Protocol),
        }
    }

    /// Starts a streaming generation and waits for its first item, so that a
    /// task failing up front is reported as an error rather than as an
    /// empty stream. The returned stream ends right after the sentinel.
    pub async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        payload: &Value,
    ) -> Result<FragmentStream, GenerationError> {
        let mut rx = self.dispatch(messages, payload, Mode::Streaming);
        let first = match rx.recv().await {
            Some(Emission::Failed(cause)) => {
                return Err(GenerationError::Failed(cause))
            }
            first => first,
        };

        Ok(Box::pin(async_stream::stream! {
            let mut next = first;
            while let Some(item) = next {
                match item {
                    Emission::Fragment(text) => yield Ok(text),
                    Emission::End => break,
                    Emission::Failed(cause) => {
                        yield Err(GenerationError::Failed(cause));
                        break;
                    }
                    Emission::Complete(_) => {
                        yield Err(GenerationError::Protocol);
                        break;
                    }
                }
                next = rx.recv().await;
            }
        }))
    }

    fn dispatch(
        &self,
        messages: Vec<ChatMessage>,
        payload: &Value,
        mode: Mode,
    ) -> EmissionReceiver {
        let params = sanitize(payload, &self.defaults);
        let (sender, receiver) = emission_channel(mode);
        let request_id = Uuid::now_v7();
        let task = WorkerTask {
            request_id,
            messages,
            params,
            model: self.model.clone(),
            sender,
        };
        self.pool.execute(move || task.run());
        debug!(
            %request_id,
            mode = mode.as_str(),
            queued = self.pool.stats().queued,
            "Dispatched generation."
        );
        receiver
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::model::FakeModel;

    const DEFAULTS: GenerationParameters = GenerationParameters {
        max_new_tokens: 128,
        do_sample: false,
        temperature: 0.6,
        top_p: 0.9,
    };

    fn bridge(model: Arc<dyn ModelCapability>, workers: usize) -> Arc<Bridge> {
        Arc::new(Bridge::new(model, WorkerPool::new(workers).unwrap(), DEFAULTS))
    }

    fn user(content: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::new("user", content)]
    }

    async fn collect(stream: FragmentStream) -> Vec<String> {
        stream.map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn unary_and_streaming_agree() {
        let bridge = bridge(Arc::new(FakeModel::new()), 2);
        let text = bridge.infer(user("the quick brown fox"), &json!({})).await;
        assert_eq!(text.unwrap(), "the quick brown fox");

        let stream = bridge.stream(user("the quick brown fox"), &json!({})).await;
        let fragments = collect(stream.unwrap()).await;
        assert_eq!(fragments, vec!["the ", "quick ", "brown ", "fox"]);
        assert_eq!(bridge.stats().submitted, 2);
    }

    #[tokio::test]
    async fn overrides_reach_the_model() {
        let bridge = bridge(Arc::new(FakeModel::new()), 1);
        let text = bridge
            .infer(user("abcdefgh"), &json!({"max_new_tokens": 3, "top_p": "x"}))
            .await
            .unwrap();
        assert_eq!(text, "abc");
    }

    #[tokio::test]
    async fn concurrent_requests_are_isolated() {
        let bridge = bridge(Arc::new(FakeModel::new()), 3);
        let mut handles = Vec::new();
        for i in 0..16 {
            let bridge = bridge.clone();
            handles.push(tokio::spawn(async move {
                let content = format!("request {} says hello", i);
                let payload = json!({});
                let text = if i % 2 == 0 {
                    bridge.infer(user(&content), &payload).await.unwrap()
                } else {
                    let stream = bridge.stream(user(&content), &payload);
                    collect(stream.await.unwrap()).await.concat()
                };
                (content, text)
            }));
        }
        for handle in handles {
            let (content, text) = handle.await.unwrap();
            assert_eq!(content, text);
        }
    }

    #[tokio::test]
    async fn saturated_pool_completes_every_request() {
        let (model, gate) = FakeModel::gated();
        let model = Arc::new(model);
        let bridge = bridge(model.clone(), 2);

        let mut handles = Vec::new();
        for i in 0..6 {
            let bridge = bridge.clone();
            handles.push(tokio::spawn(async move {
                bridge.infer(user(&format!("r{}", i)), &json!({})).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = bridge.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.queued, 4);

        gate.open();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), format!("r{}", i));
        }
        assert_eq!(model.max_running(), 2);
        assert_eq!(bridge.stats().submitted, 6);
    }

    #[tokio::test]
    async fn failures_surface_as_errors() {
        let bridge = bridge(Arc::new(FakeModel::failing()), 1);
        let err = bridge.infer(user("Hi"), &json!({})).await.unwrap_err();
        assert!(matches!(err, GenerationError::Failed(_)));
        assert!(bridge.stream(user("Hi"), &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn late_failure_ends_the_stream_with_an_error() {
        let bridge = bridge(Arc::new(FakeModel::failing_after(5)), 1);
        let stream = bridge.stream(user("one two three"), &json!({})).await;
        let items: Vec<_> = stream.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("one ".to_owned()));
        assert!(matches!(&items[1], Err(GenerationError::Failed(_))));
    }

    #[tokio::test]
    async fn empty_reply_is_an_empty_stream() {
        let bridge = bridge(Arc::new(FakeModel::new()), 1);
        let stream = bridge.stream(user(""), &json!({})).await;
        assert!(collect(stream.unwrap()).await.is_empty());
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let bridge = bridge(Arc::new(FakeModel::panicking()), 1);
        for _ in 0..3 {
            let err = bridge.infer(user("Hi"), &json!({})).await.unwrap_err();
            assert!(matches!(err, GenerationError::Failed(_)));
        }
        assert_eq!(bridge.stats().size, 1);
    }
}
