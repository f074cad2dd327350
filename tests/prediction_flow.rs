//! Prediction, result feedback and the HTTP surface end to end

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{FixedPredictor, PrefixFeatures, SwitchableRemote};
use edgeline_backend::api::{create_router, AppState};
use edgeline_backend::cache::ResilientCache;
use edgeline_backend::calibration::CalibrationTracker;
use edgeline_backend::config::{CacheConfig, CalibrationConfig, PredictionConfig};
use edgeline_backend::live::BroadcastHub;
use edgeline_backend::prediction::{
    FeatureMap, MarketOdds, OddsBook, Outcome, PredictionOrchestrator, Unconfigured,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct Stack {
    cache: Arc<ResilientCache>,
    calibration: Arc<CalibrationTracker>,
    orchestrator: Arc<PredictionOrchestrator>,
    predictor: Arc<FixedPredictor>,
}

fn stack(cache: Arc<ResilientCache>, probabilities: [f64; 3]) -> Stack {
    let calibration = Arc::new(CalibrationTracker::new(
        cache.clone(),
        CalibrationConfig {
            min_samples: 10,
            ..CalibrationConfig::default()
        },
    ));
    let predictor = Arc::new(FixedPredictor::new(probabilities));
    let orchestrator = Arc::new(PredictionOrchestrator::new(
        cache.clone(),
        calibration.clone(),
        predictor.clone(),
        Arc::new(PrefixFeatures),
        &PredictionConfig::default(),
    ));
    Stack {
        cache,
        calibration,
        orchestrator,
        predictor,
    }
}

fn app(s: &Stack) -> axum::Router {
    create_router(AppState {
        cache: s.cache.clone(),
        calibration: s.calibration.clone(),
        orchestrator: s.orchestrator.clone(),
        hub: BroadcastHub::new(16),
        prometheus: None,
    })
}

async fn call(app: axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn local_cache() -> Arc<ResilientCache> {
    Arc::new(ResilientCache::local_only(&CacheConfig::default()))
}

#[tokio::test]
async fn calibration_learns_from_results() {
    let s = stack(local_cache(), [0.7, 0.2, 0.1]);
    let segment = Some("epl");

    // The model keeps backing the home side; away keeps winning
    for i in 0..12 {
        let home = 0.55 + (i % 4) as f64 * 0.1;
        let rest = (1.0 - home) / 2.0;
        let features = FeatureMap::new();
        let match_id = format!("m{}", i);
        let record = s
            .orchestrator
            .predict(segment, &match_id, &features, None)
            .await
            .unwrap();
        assert_eq!(record.segment_id, "epl");
        // Swap in the varied prediction so calibration sees distinct values
        s.calibration
            .record_outcome("epl", [home, rest, rest], Outcome::Away)
            .await
            .unwrap();
    }

    let curves = s.calibration.curves("epl").await;
    assert_eq!(curves.len(), 3);
    assert!(curves.iter().all(|c| c.is_monotonic()));

    let calibrated = s.calibration.apply("epl", [0.7, 0.2, 0.1]).await;
    assert!(calibrated[2] > 0.1, "away should be pulled up: {:?}", calibrated);
    assert!((calibrated.iter().sum::<f64>() - 1.0).abs() < 1e-9);

    // A fresh prediction uses the new curves
    let record = s
        .orchestrator
        .predict(segment, "m99", &FeatureMap::new(), None)
        .await
        .unwrap();
    assert!((record.raw_probabilities[0] - 0.7).abs() < 1e-9);
    assert!(record.calibrated_probabilities[2] > 0.5);
}

#[tokio::test]
async fn prediction_survives_full_cache_outage() {
    let remote = Arc::new(SwitchableRemote::default());
    remote.set_failing(true);
    let cache = Arc::new(ResilientCache::new(Some(remote), &CacheConfig::default()));
    let s = stack(cache, [0.55, 0.25, 0.20]);

    let odds = OddsBook::new(
        "m1",
        vec![MarketOdds {
            bookmaker: "alpha".into(),
            prices: [2.10, 3.40, 4.50],
        }],
    );
    let first = s
        .orchestrator
        .predict_match(None, "m1", Some(&odds))
        .await
        .unwrap();
    assert_eq!(first.value_bets.len(), 1);

    let second = s.orchestrator.predict_match(None, "m1", None).await.unwrap();
    assert_eq!(second.generated_at, first.generated_at);
    assert_eq!(s.predictor.calls(), 1);
}

#[tokio::test]
async fn http_prediction_and_result_endpoints() {
    let s = stack(local_cache(), [0.55, 0.25, 0.20]);

    let (status, body) = call(
        app(&s),
        "POST",
        "/api/predictions",
        Some(json!({
            "match_id": "m1",
            "segment_id": "epl",
            "odds": {
                "match_id": "m1",
                "markets": [{"bookmaker": "alpha", "prices": [2.10, 3.40, 4.50]}]
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["segment_id"], "epl");
    assert_eq!(body["value_bets"][0]["outcome"], "home");
    assert_eq!(body["value_bets"][0]["bookmaker"], "alpha");

    let (status, _) = call(
        app(&s),
        "POST",
        "/api/predictions",
        Some(json!({"match_id": "x1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        app(&s),
        "POST",
        "/api/results",
        Some(json!({"match_id": "m1", "segment_id": "epl", "outcome": "home"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["learned"], true);

    let (status, body) = call(app(&s), "GET", "/api/calibration/epl", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["window_len"], 1);

    let (status, body) = call(app(&s), "GET", "/api/cache/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backend_enabled"], false);

    let (status, body) = call(app(&s), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn http_prediction_unavailable_maps_to_503() {
    let cache = local_cache();
    let calibration = Arc::new(CalibrationTracker::new(cache.clone(), CalibrationConfig::default()));
    let orchestrator = Arc::new(PredictionOrchestrator::new(
        cache.clone(),
        calibration.clone(),
        Arc::new(Unconfigured),
        Arc::new(PrefixFeatures),
        &PredictionConfig::default(),
    ));
    let app = create_router(AppState {
        cache: cache.clone(),
        calibration,
        orchestrator,
        hub: BroadcastHub::new(16),
        prometheus: None,
    });

    let (status, body) = call(app, "POST", "/api/predictions", Some(json!({"match_id": "m1"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("prediction unavailable"));
    assert!(!cache.exists("prediction:latest:m1").await);
}
