use chrono::Utc;
use rollcall_core::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct VecSource(Mutex<HashMap<String, Vec<EmbeddingRecord>>>);

impl VecSource {
    fn new(records: Vec<EmbeddingRecord>) -> Self {
        let mut map: HashMap<String, Vec<EmbeddingRecord>> = HashMap::new();
        for r in records {
            map.entry(r.identity_id.clone()).or_default().push(r);
        }
        Self(Mutex::new(map))
    }
}

impl EmbeddingSource for VecSource {
    fn fetch_embeddings(
        &self,
        identity_ids: &[String],
    ) -> Result<HashMap<String, Vec<EmbeddingRecord>>, SourceError> {
        let map = self.0.lock().unwrap();
        Ok(identity_ids
            .iter()
            .filter_map(|id| map.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }

    fn identity_ids(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.0.lock().unwrap().keys().cloned().collect())
    }
}

struct ScriptedDetector(Vec<DetectedFace>);

impl FaceDetector for ScriptedDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError> {
        Ok(self.0.clone())
    }
}

struct ConstantEmbedder(Vec<f32>);

impl FaceEmbedder for ConstantEmbedder {
    fn embed(&mut self, _frame: &Frame, _face: &DetectedFace) -> Result<Vec<f32>, EmbedderError> {
        Ok(self.0.clone())
    }
}

struct FixedQuality(u8);

impl QualityAssessor for FixedQuality {
    fn assess(&self, _face: &DetectedFace) -> QualityScore {
        let penalty = 1.0 - self.0 as f32 / 100.0;
        QualityScore::from_components(penalty, penalty, penalty)
    }
}

struct CountingMatcher(Arc<AtomicUsize>);

impl Matcher for CountingMatcher {
    fn find(&self, query: &[f32], gallery: &Gallery, threshold: f64, top_k: usize) -> MatchResult {
        self.0.fetch_add(1, Ordering::SeqCst);
        CosineMatcher.find(query, gallery, threshold, top_k)
    }
}

struct FixedSpoof {
    components: SpoofComponents,
    calls: Arc<AtomicUsize>,
}

impl SpoofScorer for FixedSpoof {
    fn score(&mut self, _face: &DetectedFace, _frame: &Frame) -> SpoofVerdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        SpoofVerdict::from_components(self.components, &SpoofWeights::default(), 0.5)
    }
}

fn enrolled() -> Vec<f32> {
    (0..EMBEDDING_DIM).map(|i| ((i % 9) as f32 - 4.0) * 0.25 + 0.1).collect()
}

fn cache_with(records: Vec<EmbeddingRecord>) -> Arc<EmbeddingCache> {
    let cache = EmbeddingCache::new(Box::new(VecSource::new(records)), 10_000);
    cache.load_all();
    Arc::new(cache)
}

fn s1() -> EmbeddingRecord {
    EmbeddingRecord {
        identity_id: "S1".into(),
        display_name: "Grace".into(),
        values: enrolled(),
        enrolled_at: Utc::now(),
    }
}

fn frame() -> Frame {
    Frame::new(vec![90; 32 * 32], 32, 32)
}

fn face() -> DetectedFace {
    let mut f = DetectedFace::new(Rect::new(4.0, 4.0, 20.0, 20.0));
    f.tracking_id = Some(11);
    f
}

#[test]
fn scenario_a_empty_store_never_matches() {
    let cache = cache_with(vec![]);
    let query = enrolled();
    let result = cache.search(&CosineMatcher, &query, 0.6, 3);
    assert!(!result.matched);
    assert!(result.candidates.is_empty());
}

#[test]
fn scenario_b_self_query_matches_with_unit_similarity() {
    let cache = cache_with(vec![s1()]);
    let result = cache.search(&CosineMatcher, &enrolled(), 0.6, 3);
    assert!(result.matched);
    let top = result.best().unwrap();
    assert_eq!(top.identity_id, "S1");
    assert!((top.similarity - 1.0).abs() < 1e-9);
}

#[test]
fn scenario_c_low_quality_exits_before_matching_and_spoofing() {
    let matcher_calls = Arc::new(AtomicUsize::new(0));
    let spoof_calls = Arc::new(AtomicUsize::new(0));
    let config = PipelineConfig {
        skip_interval: 1,
        min_quality_percent: 30,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(
        ScriptedDetector(vec![face()]),
        ConstantEmbedder(enrolled()),
        cache_with(vec![s1()]),
        config,
    )
    .unwrap()
    .with_assessor(FixedQuality(25))
    .with_matcher(CountingMatcher(matcher_calls.clone()))
    .with_spoof_scorer(FixedSpoof {
        components: SpoofComponents::uniform(0.1),
        calls: spoof_calls.clone(),
    });

    let report = pipeline.process_frame(&frame());
    let verdict = report.primary().unwrap();
    assert_eq!(verdict.status, VerdictStatus::LowQuality);
    assert_eq!(verdict.quality.unwrap().percent, 25);
    assert!(verdict.face_detected);
    assert!(!verdict.quality_ok);
    assert_eq!(matcher_calls.load(Ordering::SeqCst), 0);
    assert_eq!(spoof_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn scenario_d_uniformly_suspicious_face_is_spoofed() {
    let components = SpoofComponents::uniform(0.9);
    let direct = SpoofVerdict::from_components(components, &SpoofWeights::default(), 0.5);
    assert!((direct.risk_score - 0.9).abs() < 1e-9);
    assert!(direct.is_spoofed);

    let spoof_calls = Arc::new(AtomicUsize::new(0));
    let config = PipelineConfig {
        skip_interval: 1,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(
        ScriptedDetector(vec![face()]),
        ConstantEmbedder(enrolled()),
        cache_with(vec![s1()]),
        config,
    )
    .unwrap()
    .with_assessor(FixedQuality(95))
    .with_spoof_scorer(FixedSpoof {
        components,
        calls: spoof_calls.clone(),
    });

    let verdict = pipeline.process_frame(&frame()).verdicts.remove(0);
    assert_eq!(verdict.status, VerdictStatus::Spoofed);
    assert!(!verdict.can_admit());
    assert_eq!(verdict.identity.unwrap().identity_id, "S1");
    assert!((verdict.spoof.unwrap().risk_score - 0.9).abs() < 1e-9);
    assert_eq!(spoof_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn scenario_e_every_second_frame_is_processed() {
    let config = PipelineConfig {
        skip_interval: 2,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(
        ScriptedDetector(vec![face()]),
        ConstantEmbedder(enrolled()),
        cache_with(vec![s1()]),
        config,
    )
    .unwrap()
    .with_assessor(FixedQuality(95))
    .with_spoof_scorer(FixedSpoof {
        components: SpoofComponents::uniform(0.1),
        calls: Arc::default(),
    });

    let outcomes: Vec<(u64, VerdictStatus)> = (1..=4)
        .map(|_| {
            let report = pipeline.process_frame(&frame());
            (report.frame_index, report.verdicts[0].status)
        })
        .collect();

    assert_eq!(
        outcomes,
        vec![
            (1, VerdictStatus::Skipped),
            (2, VerdictStatus::Recognized),
            (3, VerdictStatus::Skipped),
            (4, VerdictStatus::Recognized),
        ]
    );
}

#[test]
fn threshold_never_eases_as_quality_drops() {
    for q in 0..100u8 {
        assert!(dynamic_threshold(q) >= dynamic_threshold(q + 1), "quality {q}");
    }
}
