//! Request server for ad-hoc signal queries
//!
//! Every request builds fresh analyzers from the current config and the bars
//! the caller sent. Nothing mutable is shared with the decision loop.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::config::{ConfigStore, SymbolConfig};
use crate::trading_core::{
    Bar, FusedDecision, FusionOptimizer, QualityGate, QualityScore, RangeBreakoutDetector, RiskProfile,
    RiskSizer, SignalCache, Strategy, StructureAnalysis, StructureAnalyzer,
};
use crate::trading_core::quality::QualityInput;
use crate::types::{Signal, SignalSource};

pub struct AppState {
    pub config: ConfigStore,
    pub cache: SignalCache<AnalyzeResponse>,
}

impl AppState {
    pub fn new(config: ConfigStore, cache_ttl: Duration) -> Self {
        Self {
            config,
            cache: SignalCache::new(cache_ttl),
        }
    }
}

/// Body of POST /api/analyze
#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub symbol: String,
    pub bars: Vec<Bar>,
    /// Extra advisory votes to fuse with the built-in strategies
    #[serde(default)]
    pub advisory: Vec<Signal>,
    /// Account balance for sizing; configured starting balance when absent
    pub balance: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResponse {
    pub symbol: String,
    pub bars: usize,
    pub structure: StructureAnalysis,
    pub decision: FusedDecision,
    pub quality: Option<QualityScore>,
    pub risk: Option<RiskProfile>,
    pub rejection: Option<String>,
}

/// Run the full decision pipeline over caller-supplied bars
pub fn analyze(config: &SymbolConfig, request: &AnalyzeRequest, balance: Decimal) -> AnalyzeResponse {
    let mut strategies = vec![
        Strategy::structure(StructureAnalyzer::new(config.structure.clone())),
        Strategy::RangeBreakout(RangeBreakoutDetector::new(config.range.clone())),
    ];
    for vote in &request.advisory {
        if let SignalSource::Advisory(name) = &vote.source {
            strategies.push(Strategy::Advisory {
                name: name.clone(),
                opinion: Some(vote.clone()),
            });
        }
    }

    let mut fusion = FusionOptimizer::new(config.fusion.clone());
    let decision = fusion.evaluate(&mut strategies, &request.bars);
    let structure = strategies
        .iter()
        .find_map(|s| match s {
            Strategy::Structure { last, .. } => last.clone(),
            _ => None,
        })
        .unwrap_or_else(|| StructureAnalysis::neutral("structure not run"));

    let mut response = AnalyzeResponse {
        symbol: request.symbol.clone(),
        bars: request.bars.len(),
        structure,
        decision,
        quality: None,
        risk: None,
        rejection: None,
    };

    let (Some(side), Some(last)) = (response.decision.direction.side(), request.bars.last()) else {
        return response;
    };

    let quality = QualityGate::new(config.quality.clone()).evaluate(&QualityInput {
        side,
        bars: &request.bars,
        structure: &response.structure,
        strength: response.decision.strength,
        timestamp: last.open_time,
    });
    let accepted = quality.accept;
    if !accepted {
        response.rejection = Some(format!("quality {:.0} below gate", quality.total));
    }
    response.quality = Some(quality);
    if !accepted {
        return response;
    }

    match RiskSizer::new(config.risk.clone()).assess(&request.bars, balance, config.spread) {
        Ok(profile) => response.risk = Some(profile),
        Err(e) => response.rejection = Some(e.to_string()),
    }
    response
}

fn cache_key(request: &AnalyzeRequest) -> Option<String> {
    if !request.advisory.is_empty() {
        return None;
    }
    let last = request.bars.last()?;
    Some(format!(
        "{}:{}:{}:{}:{:?}",
        request.symbol,
        request.bars.len(),
        last.open_time.timestamp(),
        last.close,
        request.balance
    ))
}

/// POST /api/analyze - Fused decision for the posted bars
pub async fn post_analyze(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeRequest>,
) -> impl IntoResponse {
    if request.symbol.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "symbol is required"})),
        );
    }
    if let Some(bad) = request.bars.iter().position(|b| !b.is_well_formed()) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"error": format!("bar {} is malformed", bad)})),
        );
    }

    let key = cache_key(&request);
    if let Some(hit) = key.as_deref().and_then(|k| state.cache.get(k)) {
        return (StatusCode::OK, Json(serde_json::json!(hit)));
    }

    let engine = state.config.snapshot().await;
    let config = engine.symbol(&request.symbol);
    let balance = request.balance.unwrap_or(engine.account.starting_balance);

    let response = analyze(&config, &request, balance);
    debug!(
        "analyze {}: {} bars -> {}",
        request.symbol, response.bars, response.decision.direction
    );
    if let Some(k) = key {
        state.cache.insert(k, response.clone());
    }
    (StatusCode::OK, Json(serde_json::json!(response)))
}

/// GET /api/health
pub async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.cache.purge_expired();
    Json(serde_json::json!({
        "status": "ok",
        "cached": state.cache.len(),
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/analyze", post(post_analyze))
        .route("/api/health", get(get_health))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::trading_core::test_support::uptrend_with_retest;
    use crate::types::Direction;

    async fn serve() -> String {
        let state = Arc::new(AppState::new(
            ConfigStore::new(EngineConfig::default()),
            Duration::from_secs(30),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_analyze_order_block_retest() {
        let bars = uptrend_with_retest()[..=55].to_vec();
        let request = AnalyzeRequest {
            symbol: "TEST".into(),
            bars,
            advisory: Vec::new(),
            balance: None,
        };
        let response = analyze(&SymbolConfig::default(), &request, Decimal::from(10_000));
        assert_eq!(response.decision.direction, Direction::Buy);
        assert!(response.quality.as_ref().unwrap().accept);
        assert!(response.risk.is_some());
    }

    #[test]
    fn test_short_history_is_neutral() {
        let request = AnalyzeRequest {
            symbol: "TEST".into(),
            bars: uptrend_with_retest()[..10].to_vec(),
            advisory: Vec::new(),
            balance: None,
        };
        let response = analyze(&SymbolConfig::default(), &request, Decimal::from(10_000));
        assert!(response.decision.is_hold());
        assert!(response.quality.is_none());
    }

    #[tokio::test]
    async fn test_http_analyze_and_health() {
        let base = serve().await;
        let client = reqwest::Client::new();

        let body = serde_json::json!({
            "symbol": "TEST",
            "bars": uptrend_with_retest()[..=55].to_vec(),
        });
        let response = client
            .post(format!("{}/api/analyze", base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["decision"]["direction"], "buy");

        let health: serde_json::Value = client
            .get(format!("{}/api/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["cached"], 1);
    }

    #[tokio::test]
    async fn test_http_rejects_malformed_bar() {
        let base = serve().await;
        let mut bars = uptrend_with_retest()[..5].to_vec();
        bars[2].high = bars[2].low - 1.0;
        let response = reqwest::Client::new()
            .post(format!("{}/api/analyze", base))
            .json(&serde_json::json!({"symbol": "TEST", "bars": bars}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 422);
    }
}
