//! Axum JSON API over the plan store, TDU reference data, and the manual
//! scrape trigger.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use repwatch_core::{tdu, PlanType, ServiceType};
use repwatch_storage::{PlanFilter, PlanStore};
use repwatch_sync::{Pipeline, SourceSelector, SyncError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "repwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PlanStore>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(store: Arc<dyn PlanStore>, pipeline: Arc<Pipeline>) -> Self {
        Self { store, pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/providers", get(list_providers_handler))
        .route("/plans", get(list_plans_handler))
        .route("/plans/scrape", post(scrape_handler))
        .route("/plans/{id}", get(plan_detail_handler))
        .route("/tdus", get(list_tdus_handler))
        .route("/tdus/{name}", get(tdu_detail_handler))
        .route("/tdus/{name}/cost", get(tdu_cost_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct PlansQuery {
    provider: Option<String>,
    plan_type: Option<String>,
    service_type: Option<String>,
    contract_months: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CostQuery {
    kwh: f64,
}

#[derive(Debug, Deserialize, Default)]
struct ScrapeQuery {
    source: Option<String>,
    service_type: Option<String>,
}

async fn list_providers_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_providers().await {
        Ok(providers) => Json(providers).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn list_plans_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PlansQuery>,
) -> Response {
    let plan_type = match query.plan_type.as_deref() {
        Some(text) => match PlanType::parse(text) {
            Some(t) => Some(t),
            None => return bad_request(format!("unknown plan_type {text:?}")),
        },
        None => None,
    };
    let service_type = match query.service_type.as_deref() {
        Some(text) => match ServiceType::parse(text) {
            Some(t) => Some(t),
            None => return bad_request(format!("unknown service_type {text:?}")),
        },
        None => None,
    };

    let filter = PlanFilter {
        provider: query.provider,
        plan_type,
        service_type,
        contract_months: query.contract_months,
        limit: query.limit,
    };
    match state.store.list_plans(&filter).await {
        Ok(plans) => Json(plans).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn plan_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.store.plan_by_id(id).await {
        Ok(Some(plan)) => Json(plan).into_response(),
        Ok(None) => not_found(format!("plan {id} not found")),
        Err(err) => server_error(err.into()),
    }
}

async fn list_tdus_handler() -> Response {
    Json(tdu::all()).into_response()
}

async fn tdu_detail_handler(Path(name): Path<String>) -> Response {
    match tdu::by_name(&name) {
        Some(found) => Json(found).into_response(),
        None => not_found(format!("TDU {name:?} not found")),
    }
}

async fn tdu_cost_handler(Path(name): Path<String>, Query(query): Query<CostQuery>) -> Response {
    let Some(found) = tdu::by_name(&name) else {
        return not_found(format!("TDU {name:?} not found"));
    };
    let total = tdu::calculate_cost(found.name, query.kwh);
    Json(serde_json::json!({
        "tdu": found.name,
        "kwh": query.kwh,
        "monthly_charge": found.monthly_charge,
        "delivery_charge_per_kwh": found.delivery_charge_per_kwh,
        "total_monthly_cost": total,
    }))
    .into_response()
}

/// Run the pipeline immediately, outside the cron schedule. With
/// `?source=<id>` only that source is refreshed; `?service_type=` keeps
/// only one customer segment.
async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScrapeQuery>,
) -> Response {
    let selector = match query.source {
        Some(source) => SourceSelector::One(source),
        None => SourceSelector::All,
    };
    let service_type = match query.service_type.as_deref() {
        Some(text) => match ServiceType::parse(text) {
            Some(t) => Some(t),
            None => return bad_request(format!("unknown service_type {text:?}")),
        },
        None => None,
    };
    match state.pipeline.run_selected(&selector, service_type).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err @ SyncError::UnknownSource(_)) => not_found(err.to_string()),
    }
}

fn not_found(message: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(%err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use repwatch_core::PlanRecord;
    use repwatch_scrape::{ExtractError, PlanSource, ScrapeError};
    use repwatch_storage::{
        reconcile, FetchedPage, MemoryStore, PageRequest, SourceFetcher,
    };
    use repwatch_sync::SyncConfig;
    use tower::ServiceExt;

    struct StubSource {
        records: Vec<PlanRecord>,
    }

    #[async_trait]
    impl PlanSource for StubSource {
        fn source_id(&self) -> &'static str {
            "stub"
        }

        fn request(&self) -> PageRequest {
            PageRequest::for_url("https://example.com/unused")
        }

        fn extract(&self, _page: &FetchedPage) -> Result<Vec<PlanRecord>, ExtractError> {
            Ok(Vec::new())
        }

        async fn scrape(&self, _fetcher: &SourceFetcher) -> Result<Vec<PlanRecord>, ScrapeError> {
            Ok(self.records.clone())
        }
    }

    fn record(provider: &str, plan: &str, rate: f64) -> PlanRecord {
        let mut record = PlanRecord::new(provider, plan);
        record.rate_1000_cents = Some(rate);
        record.contract_months = Some(12);
        record
    }

    async fn test_state(seed: &[PlanRecord], stub: Vec<PlanRecord>) -> AppState {
        let store = Arc::new(MemoryStore::new());
        reconcile(store.as_ref(), seed).await;
        let pipeline = Pipeline::new(store.clone(), &SyncConfig::default())
            .unwrap()
            .with_sources(vec![Arc::new(StubSource { records: stub })]);
        AppState::new(store, Arc::new(pipeline))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn plans_endpoint_lists_and_filters() {
        let seed = vec![
            record("TXU Energy", "Value 12", 12.5),
            record("Gexa Energy", "Choice 12", 11.7),
        ];
        let state = test_state(&seed, Vec::new()).await;

        let (status, body) = get_json(app(state.clone()), "/plans").await;
        assert_eq!(status, StatusCode::OK);
        let plans = body.as_array().unwrap();
        assert_eq!(plans.len(), 2);
        // Cheapest first.
        assert_eq!(plans[0]["plan_name"], "Choice 12");

        let (status, body) = get_json(app(state.clone()), "/plans?provider=TXU%20Energy").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _body) = get_json(app(state), "/plans?plan_type=Imaginary").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn plan_detail_404s_on_missing_id() {
        let state = test_state(&[record("TXU Energy", "Value 12", 12.5)], Vec::new()).await;

        let (status, body) = get_json(app(state.clone()), "/plans/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["plan_name"], "Value 12");

        let (status, _body) = get_json(app(state), "/plans/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn providers_endpoint_includes_backfilled_website() {
        let state = test_state(&[record("Gexa Energy", "Choice 12", 11.7)], Vec::new()).await;
        let (status, body) = get_json(app(state), "/providers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "Gexa Energy");
        assert_eq!(body[0]["website"], "https://www.gexaenergy.com");
    }

    #[tokio::test]
    async fn tdu_endpoints_serve_reference_data_and_costs() {
        let state = test_state(&[], Vec::new()).await;

        let (status, body) = get_json(app(state.clone()), "/tdus").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 6);

        let (status, body) = get_json(app(state.clone()), "/tdus/Oncor").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Oncor");

        let (status, body) = get_json(app(state.clone()), "/tdus/oncor/cost?kwh=1000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_monthly_cost"], 54.57);

        let (status, _body) = get_json(app(state), "/tdus/NoSuchUtility").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scrape_trigger_runs_the_pipeline() {
        let state = test_state(&[], vec![record("Reliant Energy", "Secure 12", 14.1)]).await;
        let app_router = app(state.clone());

        let resp = app_router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/plans/scrape")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let summary: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary["added"], 1);

        let (status, body) = get_json(app(state), "/plans").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scrape_trigger_404s_on_unknown_source() {
        let state = test_state(&[], Vec::new()).await;
        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/plans/scrape?source=no-such-source")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
