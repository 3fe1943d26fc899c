use facematch_core::{
    Capability, GalleryEntry, GallerySnapshot, MatchResult, Pipeline, PipelineConfig, PipelineError,
    RgbImage,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from the async side to the engine thread.
enum EngineRequest {
    Recognize {
        image: RgbImage,
        gallery: GallerySnapshot,
        threshold: Option<f32>,
        reply: Reply<Vec<MatchResult>>,
    },
    Enroll {
        image: RgbImage,
        identity: String,
        reply: Reply<GalleryEntry>,
    },
    Capability {
        reply: Reply<Capability>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Detect, embed and match every face in `image`.
    pub async fn recognize(
        &self,
        image: RgbImage,
        gallery: GallerySnapshot,
        threshold: Option<f32>,
    ) -> Result<Vec<MatchResult>, EngineError> {
        self.request(|reply| EngineRequest::Recognize {
            image,
            gallery,
            threshold,
            reply,
        })
        .await
    }

    /// Build a gallery entry for `identity` from the first face in `image`.
    pub async fn enroll(&self, image: RgbImage, identity: String) -> Result<GalleryEntry, EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            image,
            identity,
            reply,
        })
        .await
    }

    pub async fn capability(&self) -> Result<Capability, EngineError> {
        self.request(|reply| EngineRequest::Capability { reply }).await
    }

    /// Send a request and wait for the reply, bounded by the handle's timeout.
    ///
    /// A timed-out request is abandoned; the engine finishes it and drops the reply.
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed)?,
            Err(_) => Err(EngineError::Timeout(self.timeout)),
        }
    }
}

/// Load the pipeline and spawn the engine on a dedicated OS thread.
///
/// Fails fast if the detector or embedder cannot be loaded.
pub fn spawn_engine(config: &PipelineConfig, timeout: Duration) -> Result<EngineHandle, EngineError> {
    let pipeline = Pipeline::load(config)?;
    spawn_with(pipeline, timeout)
}

fn spawn_with(mut pipeline: Pipeline, timeout: Duration) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facematch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize {
                        image,
                        gallery,
                        threshold,
                        reply,
                    } => {
                        let result = pipeline
                            .recognize(&image, &gallery, threshold)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Enroll {
                        image,
                        identity,
                        reply,
                    } => {
                        let result = pipeline.enroll(&image, &identity).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Capability { reply } => {
                        let _ = reply.send(Ok(pipeline.capability()));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}


#[cfg(test)]
mod tests {
    use super::test_support::{engine, face};
    use super::*;
    use facematch_core::Identity;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_enroll_then_recognize() {
        let handle = engine(vec![face()], Duration::ZERO, Duration::from_secs(5));
        let image = RgbImage::new(16, 16);

        let entry = handle.enroll(image.clone(), "Alice".into()).await.unwrap();
        assert_eq!(entry.identity, "Alice");

        let results = handle
            .recognize(image, Arc::new(vec![entry.clone()]), None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].identity, Identity::Known("Alice".into()));
        assert_eq!(results[0].matched_entry_id.as_deref(), Some(entry.id.as_str()));
    }

    #[tokio::test]
    async fn test_enroll_without_face() {
        let handle = engine(Vec::new(), Duration::ZERO, Duration::from_secs(5));
        let err = handle.enroll(RgbImage::new(16, 16), "Alice".into()).await.unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::NoFaceDetected)));
    }

    #[tokio::test]
    async fn test_capability() {
        let handle = engine(Vec::new(), Duration::ZERO, Duration::from_secs(5));
        let cap = handle.capability().await.unwrap();
        assert_eq!(cap.detector, "fixed");
        assert_eq!(cap.embedding_dim, 2);
        assert!(cap.available);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let handle = engine(vec![face()], Duration::from_millis(300), Duration::from_millis(20));
        let err = handle
            .recognize(RgbImage::new(16, 16), Arc::new(Vec::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }
}
