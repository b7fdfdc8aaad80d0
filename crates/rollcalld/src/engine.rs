use crate::config::Config;
use rollcall_core::{
    CacheStats, EmbeddingCache, EmbeddingSource, FaceDetector, FaceEmbedder, Frame, FrameReport, InvalidConfig,
    LoadReport, OperatingMode, Pipeline, PipelineVerdict, Preload,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("session thread exited")]
    ChannelClosed,
    #[error(transparent)]
    Config(#[from] InvalidConfig),
}

/// Session counters reported by [`SessionHandle::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionStats {
    pub mode: OperatingMode,
    pub frames_seen: u64,
    pub disposed: bool,
    pub cache: CacheStats,
}

/// Messages sent from callers to the session thread.
enum SessionRequest {
    ProcessFrame {
        frame: Frame,
        reply: oneshot::Sender<FrameReport>,
    },
    SetMode {
        mode: OperatingMode,
        reply: oneshot::Sender<()>,
    },
    Preload {
        which: Preload,
        reply: oneshot::Sender<LoadReport>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to a session thread.
///
/// All requests are served one at a time by the thread that owns the
/// pipeline, so a preload or clear can never interleave with a frame.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
    frame_timeout: Duration,
}

impl SessionHandle {
    /// Process one frame within the session's configured frame timeout.
    pub async fn process_frame(&self, frame: Frame) -> FrameReport {
        self.process_frame_within(frame, self.frame_timeout).await
    }

    /// Process one frame, giving up after `timeout`.
    ///
    /// Always yields a report. On expiry the report holds a single `TIMEOUT`
    /// verdict; if the session thread is gone it holds `ERROR`. In both cases
    /// `frame_index` is 0 because no index was assigned to this caller. A
    /// frame that times out is still finished by the session thread and its
    /// result discarded, so the pipeline is never left mid-frame.
    pub async fn process_frame_within(&self, frame: Frame, timeout: Duration) -> FrameReport {
        let exchange = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(SessionRequest::ProcessFrame { frame, reply: reply_tx })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "frame request failed");
                FrameReport::single(0, PipelineVerdict::error(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "frame processing timed out");
                FrameReport::single(
                    0,
                    PipelineVerdict::timeout(format!("no verdict within {}ms", timeout.as_millis())),
                )
            }
        }
    }

    pub async fn set_mode(&self, mode: OperatingMode) -> Result<(), EngineError> {
        self.request(|reply| SessionRequest::SetMode { mode, reply }).await
    }

    pub async fn preload(&self, which: Preload) -> Result<LoadReport, EngineError> {
        self.request(|reply| SessionRequest::Preload { which, reply }).await
    }

    pub async fn stats(&self) -> Result<SessionStats, EngineError> {
        self.request(|reply| SessionRequest::Stats { reply }).await
    }

    /// Clear the cache and release detector resources. The thread keeps
    /// serving requests; later frames report `ERROR`.
    pub async fn dispose(&self) -> Result<(), EngineError> {
        self.request(|reply| SessionRequest::Dispose { reply }).await
    }

    pub fn frame_timeout(&self) -> Duration {
        self.frame_timeout
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Build a session from host configuration: a cache over `source` bounded
/// by `max_cached_embeddings`, a pipeline with the configured tunables, and
/// a handle whose frames expire after `frame_timeout_ms`.
pub fn open_session<S, D, E>(config: &Config, source: S, detector: D, embedder: E) -> Result<SessionHandle, EngineError>
where
    S: EmbeddingSource + 'static,
    D: FaceDetector + 'static,
    E: FaceEmbedder + 'static,
{
    let cache = Arc::new(EmbeddingCache::new(
        Box::new(source),
        config.pipeline.max_cached_embeddings,
    ));
    let pipeline = Pipeline::new(detector, embedder, cache, config.pipeline.clone())?;
    spawn_session(pipeline, config.frame_timeout())
}

/// Move `pipeline` onto a dedicated OS thread and return a handle to it.
///
/// The thread exits once every handle has been dropped.
pub fn spawn_session<D, E>(mut pipeline: Pipeline<D, E>, frame_timeout: Duration) -> Result<SessionHandle, EngineError>
where
    D: FaceDetector + 'static,
    E: FaceEmbedder + 'static,
{
    let (tx, mut rx) = mpsc::channel::<SessionRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-session".into())
        .spawn(move || {
            tracing::info!(mode = pipeline.mode().as_str(), "session thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    SessionRequest::ProcessFrame { frame, reply } => {
                        let report = pipeline.process_frame(&frame);
                        let _ = reply.send(report);
                    }
                    SessionRequest::SetMode { mode, reply } => {
                        pipeline.set_mode(mode);
                        let _ = reply.send(());
                    }
                    SessionRequest::Preload { which, reply } => {
                        let report = pipeline.preload(which);
                        let _ = reply.send(report);
                    }
                    SessionRequest::Stats { reply } => {
                        let _ = reply.send(SessionStats {
                            mode: pipeline.mode(),
                            frames_seen: pipeline.frame_counter(),
                            disposed: pipeline.is_disposed(),
                            cache: pipeline.cache().stats(),
                        });
                    }
                    SessionRequest::Dispose { reply } => {
                        pipeline.dispose();
                        let _ = reply.send(());
                    }
                }
            }
            tracing::info!("session thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(SessionHandle { tx, frame_timeout })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EmbeddingStore;
    use chrono::Utc;
    use rollcall_core::{
        DetectedFace, DetectorError, EmbedderError, EmbeddingRecord, PipelineConfig, Rect, SpoofComponents,
        SpoofScorer, SpoofVerdict, SpoofWeights, VerdictStatus, EMBEDDING_DIM,
    };
    use std::path::{Path, PathBuf};

    struct OneFace {
        delay: Duration,
    }

    impl FaceDetector for OneFace {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError> {
            std::thread::sleep(self.delay);
            let mut face = DetectedFace::new(Rect::new(8.0, 8.0, 32.0, 32.0));
            face.tracking_id = Some(1);
            Ok(vec![face])
        }
    }

    struct Fixed(Vec<f32>);

    impl FaceEmbedder for Fixed {
        fn embed(&mut self, _frame: &Frame, _face: &DetectedFace) -> Result<Vec<f32>, EmbedderError> {
            Ok(self.0.clone())
        }
    }

    struct Live;

    impl SpoofScorer for Live {
        fn score(&mut self, _face: &DetectedFace, _frame: &Frame) -> SpoofVerdict {
            SpoofVerdict::from_components(SpoofComponents::uniform(0.1), &SpoofWeights::default(), 0.5)
        }
    }

    fn vector() -> Vec<f32> {
        (0..EMBEDDING_DIM).map(|i| (i as f32 * 0.3).sin() + 0.05).collect()
    }

    fn store(ids: &[&str]) -> Arc<EmbeddingStore> {
        let store = Arc::new(EmbeddingStore::open(Path::new(":memory:")).unwrap());
        for id in ids {
            store
                .insert(&EmbeddingRecord {
                    identity_id: id.to_string(),
                    display_name: "Ada".into(),
                    values: vector(),
                    enrolled_at: Utc::now(),
                })
                .unwrap();
        }
        store
    }

    fn config() -> Config {
        // Landmark-free faces assess at 33%, which multi mode matches at 0.90.
        Config {
            db_path: PathBuf::from(":memory:"),
            frame_timeout_ms: 5_000,
            pipeline: PipelineConfig {
                mode: OperatingMode::Multi,
                skip_interval: 1,
                min_quality_percent: 0,
                ..PipelineConfig::default()
            },
        }
    }

    fn session(delay: Duration) -> SessionHandle {
        let cache = Arc::new(EmbeddingCache::new(Box::new(store(&["S1"])), 1_000));
        let pipeline = Pipeline::new(OneFace { delay }, Fixed(vector()), cache, config().pipeline)
            .unwrap()
            .with_spoof_scorer(Live);
        spawn_session(pipeline, Duration::from_secs(5)).unwrap()
    }

    fn frame() -> Frame {
        Frame::new(vec![0; 48 * 48], 48, 48)
    }

    #[tokio::test]
    async fn test_preload_then_recognize() {
        let handle = session(Duration::ZERO);

        let report = handle.preload(Preload::All).await.unwrap();
        assert_eq!(report.loaded_identities, 1);

        let report = handle.process_frame(frame()).await;
        assert_eq!(report.frame_index, 1);
        let verdict = report.primary().unwrap();
        assert_eq!(verdict.status, VerdictStatus::Recognized);
        assert_eq!(verdict.identity.as_ref().unwrap().identity_id, "S1");
    }

    #[tokio::test]
    async fn test_without_preload_detects_only() {
        let handle = session(Duration::ZERO);
        let report = handle.process_frame(frame()).await;
        assert_eq!(report.primary().unwrap().status, VerdictStatus::DetectedOnly);
    }

    #[tokio::test]
    async fn test_timeout_verdict() {
        let handle = session(Duration::from_millis(300));
        let report = handle.process_frame_within(frame(), Duration::from_millis(20)).await;
        let verdict = report.primary().unwrap();
        assert_eq!(verdict.status, VerdictStatus::Timeout);
        assert!(!verdict.face_detected);
        assert!(!verdict.can_admit());

        // The abandoned frame still completes on the session thread.
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.frames_seen, 1);
    }

    #[tokio::test]
    async fn test_set_mode_and_stats() {
        let handle = session(Duration::ZERO);
        handle.set_mode(OperatingMode::Single).await.unwrap();
        handle.preload(Preload::All).await.unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.mode, OperatingMode::Single);
        assert_eq!(stats.cache.identity_count, 1);
        assert!(!stats.disposed);
    }

    #[tokio::test]
    async fn test_dispose() {
        let handle = session(Duration::ZERO);
        handle.preload(Preload::All).await.unwrap();
        handle.dispose().await.unwrap();

        let stats = handle.stats().await.unwrap();
        assert!(stats.disposed);
        assert_eq!(stats.cache.embedding_count, 0);

        let report = handle.process_frame(frame()).await;
        assert_eq!(report.primary().unwrap().status, VerdictStatus::Error);
    }

    #[tokio::test]
    async fn test_open_session_bounds_cache_from_config() {
        let mut config = config();
        config.pipeline.max_cached_embeddings = 1;
        let handle = open_session(&config, store(&["S1", "S2"]), OneFace { delay: Duration::ZERO }, Fixed(vector()))
            .unwrap();
        assert_eq!(handle.frame_timeout(), Duration::from_secs(5));

        let report = handle.preload(Preload::All).await.unwrap();
        assert!(report.truncated);
        assert_eq!(report.loaded_embeddings, 1);
        assert_eq!(handle.stats().await.unwrap().cache.embedding_count, 1);
    }

    #[tokio::test]
    async fn test_open_session_uses_configured_frame_timeout() {
        let mut config = config();
        config.frame_timeout_ms = 20;
        let handle = open_session(
            &config,
            store(&["S1"]),
            OneFace {
                delay: Duration::from_millis(300),
            },
            Fixed(vector()),
        )
        .unwrap();
        assert_eq!(handle.frame_timeout(), Duration::from_millis(20));

        let report = handle.process_frame(frame()).await;
        assert_eq!(report.primary().unwrap().status, VerdictStatus::Timeout);
    }

    #[test]
    fn test_open_session_rejects_invalid_config() {
        let mut config = config();
        config.pipeline.top_k = 0;
        let result = open_session(&config, store(&[]), OneFace { delay: Duration::ZERO }, Fixed(vector()));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
