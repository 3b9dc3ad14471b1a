//! Axum JSON boundary: per-source ingestion endpoints + ops surface.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use lira_core::{
    AssignmentPriority, AutoReassignmentRule, ChangeReason, EngineError,
};
use lira_ingest::{IngestPipeline, TenantRegistry};
use lira_routing::AssignmentRouter;
use lira_store::{
    AgentStore, AssignmentStore, LeadStore, NotificationStore, QuarantineStore, RuleStore, Store,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lira-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub router: Arc<AssignmentRouter>,
    pub pipeline: Arc<IngestPipeline>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, tenants: TenantRegistry) -> Self {
        let router = Arc::new(AssignmentRouter::new(store.clone()));
        let pipeline = Arc::new(IngestPipeline::new(store.clone(), router.clone(), tenants));
        Self {
            store,
            router,
            pipeline,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/companies/{company_id}/ingest/{source}",
            get(ingest_challenge_handler).post(ingest_handler),
        )
        .route(
            "/companies/{company_id}/portal/{portal}",
            post(portal_ingest_handler),
        )
        .route("/companies/{company_id}/leads", get(leads_handler))
        .route(
            "/companies/{company_id}/leads/pending",
            get(pending_leads_handler),
        )
        .route("/leads/{id}", get(lead_handler))
        .route("/leads/{id}/history", get(lead_history_handler))
        .route("/leads/{id}/assign", post(assign_handler))
        .route(
            "/companies/{company_id}/leads/bulk-assign",
            post(bulk_assign_handler),
        )
        .route("/leads/{id}/undo", post(undo_handler))
        .route("/leads/{id}/priority", post(priority_handler))
        .route("/agents/{id}/availability", post(availability_handler))
        .route(
            "/companies/{company_id}/notifications",
            get(notifications_handler),
        )
        .route("/notifications/{id}/read", post(mark_read_handler))
        .route(
            "/companies/{company_id}/notifications/read-all",
            post(mark_all_read_handler),
        )
        .route(
            "/companies/{company_id}/rules",
            get(rules_handler).post(upsert_rule_handler),
        )
        .route("/rules/{id}", delete(delete_rule_handler))
        .route(
            "/companies/{company_id}/import-errors",
            get(import_errors_handler),
        )
        .route("/import-errors/{id}/retry", post(retry_import_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("LIRA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "lead engine web boundary listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn error_response(err: EngineError) -> Response {
    let status = match &err {
        EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Duplicate(_) => StatusCode::CONFLICT,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::NoAgentsAvailable(_) | EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Dependency(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn ok_json<T: serde::Serialize>(value: T) -> Response {
    Json(value).into_response()
}

/// Subscription-style webhook verification: echo the provider challenge.
async fn ingest_challenge_handler(
    AxumPath((_company_id, _source)): AxumPath<(Uuid, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let challenge = params
        .get("challenge")
        .or_else(|| params.get("hub.challenge"));
    match challenge {
        Some(value) => (StatusCode::OK, value.clone()).into_response(),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing challenge parameter" })),
        )
            .into_response(),
    }
}

/// Provider-shaped payload, object or array. Per-lead failures show up only
/// in the aggregated counts; the response stays successful so providers do
/// not retry an already-processed batch.
async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((company_id, source)): AxumPath<(Uuid, String)>,
    Json(payload): Json<JsonValue>,
) -> Response {
    match state.pipeline.ingest(company_id, &source, &payload).await {
        Ok(report) => ok_json(report),
        Err(EngineError::Validation(message)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": message })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

async fn portal_ingest_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((company_id, portal)): AxumPath<(Uuid, String)>,
    Json(payload): Json<JsonValue>,
) -> Response {
    match state
        .pipeline
        .ingest_portal(company_id, &portal, &payload)
        .await
    {
        Ok(report) => ok_json(report),
        Err(err) => error_response(err),
    }
}

async fn leads_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(company_id): AxumPath<Uuid>,
) -> Response {
    match state.store.leads_for_company(company_id).await {
        Ok(leads) => ok_json(leads),
        Err(err) => error_response(err),
    }
}

async fn pending_leads_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(company_id): AxumPath<Uuid>,
) -> Response {
    match state.store.unassigned_leads(company_id).await {
        Ok(leads) => ok_json(leads),
        Err(err) => error_response(err),
    }
}

async fn lead_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.lead(id).await {
        Ok(lead) => ok_json(lead),
        Err(err) => error_response(err),
    }
}

async fn lead_history_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.history_for_lead(id).await {
        Ok(history) => ok_json(history),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct AssignBody {
    agent_id: Uuid,
    #[serde(default)]
    changed_by: Option<Uuid>,
}

async fn assign_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<AssignBody>,
) -> Response {
    match state
        .router
        .assign_lead(id, body.agent_id, ChangeReason::Manual, body.changed_by)
        .await
    {
        Ok(history) => ok_json(history),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct BulkAssignBody {
    lead_ids: Vec<Uuid>,
    agent_id: Uuid,
    #[serde(default)]
    changed_by: Option<Uuid>,
}

async fn bulk_assign_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(_company_id): AxumPath<Uuid>,
    Json(body): Json<BulkAssignBody>,
) -> Response {
    match state
        .router
        .bulk_assign(&body.lead_ids, body.agent_id, body.changed_by)
        .await
    {
        Ok(count) => ok_json(json!({ "assigned": count })),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct UndoBody {
    #[serde(default)]
    changed_by: Option<Uuid>,
}

async fn undo_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<UndoBody>,
) -> Response {
    match state.router.undo_assignment(id, body.changed_by).await {
        Ok(undone) => ok_json(json!({ "undone": undone })),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct PriorityBody {
    priority: String,
}

async fn priority_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<PriorityBody>,
) -> Response {
    let Some(priority) = AssignmentPriority::parse(&body.priority) else {
        return error_response(EngineError::Validation(format!(
            "unknown priority {}",
            body.priority
        )));
    };
    match state.router.set_priority(id, priority).await {
        Ok(()) => ok_json(json!({ "priority": priority.as_str() })),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct AvailabilityBody {
    is_available: bool,
}

async fn availability_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<AvailabilityBody>,
) -> Response {
    match state
        .store
        .update_agent_availability(id, body.is_available)
        .await
    {
        Ok(()) => ok_json(json!({ "is_available": body.is_available })),
        Err(err) => error_response(err),
    }
}

async fn notifications_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(company_id): AxumPath<Uuid>,
) -> Response {
    match state.store.notifications_for_company(company_id).await {
        Ok(notifications) => ok_json(notifications),
        Err(err) => error_response(err),
    }
}

async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.mark_read(id).await {
        Ok(()) => ok_json(json!({ "read": true })),
        Err(err) => error_response(err),
    }
}

async fn mark_all_read_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(company_id): AxumPath<Uuid>,
) -> Response {
    match state.store.mark_all_read(company_id).await {
        Ok(count) => ok_json(json!({ "read": count })),
        Err(err) => error_response(err),
    }
}

async fn rules_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(company_id): AxumPath<Uuid>,
) -> Response {
    match state.store.rules_for_company(company_id).await {
        Ok(rules) => ok_json(rules),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct RuleBody {
    #[serde(default)]
    id: Option<Uuid>,
    days_without_contact: i64,
    #[serde(default)]
    use_round_robin: Option<bool>,
    #[serde(default)]
    is_active: Option<bool>,
    apply_to_stages: Vec<String>,
}

async fn upsert_rule_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(company_id): AxumPath<Uuid>,
    Json(body): Json<RuleBody>,
) -> Response {
    if body.days_without_contact <= 0 {
        return error_response(EngineError::Validation(
            "days_without_contact must be positive".to_string(),
        ));
    }
    let rule = AutoReassignmentRule {
        id: body.id.unwrap_or_else(Uuid::new_v4),
        company_id,
        days_without_contact: body.days_without_contact,
        use_round_robin: body.use_round_robin.unwrap_or(true),
        is_active: body.is_active.unwrap_or(true),
        apply_to_stages: body.apply_to_stages,
    };
    match state.store.upsert_rule(rule.clone()).await {
        Ok(()) => ok_json(rule),
        Err(err) => error_response(err),
    }
}

async fn delete_rule_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.delete_rule(id).await {
        Ok(()) => ok_json(json!({ "deleted": true })),
        Err(err) => error_response(err),
    }
}

async fn import_errors_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(company_id): AxumPath<Uuid>,
) -> Response {
    match state.store.open_import_errors(company_id).await {
        Ok(errors) => ok_json(errors),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct RetryBody {
    #[serde(default)]
    payload: Option<JsonValue>,
    #[serde(default)]
    resolved_by: Option<Uuid>,
}

async fn retry_import_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<RetryBody>,
) -> Response {
    match state
        .pipeline
        .retry_import(id, body.payload, body.resolved_by)
        .await
    {
        Ok(report) => ok_json(report),
        Err(err) => error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use lira_core::AgentLoad;
    use lira_store::MemoryStore;
    use tower::ServiceExt;

    fn test_state() -> (Arc<MemoryStore>, AppState, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();
        let state = AppState::new(store.clone(), TenantRegistry::default());
        (store, state, company)
    }

    fn agent(company: Uuid) -> AgentLoad {
        AgentLoad {
            agent_id: Uuid::new_v4(),
            company_id: company,
            agent_name: "Agent".to_string(),
            current_leads_count: 0,
            pending_followups_count: 0,
            assignments_today: 0,
            assignments_week: 0,
            conversion_rate: 0.0,
            max_leads_capacity: 10,
            is_available: true,
            last_assignment_at: None,
        }
    }

    fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn body_json(response: Response) -> JsonValue {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn webhook_challenge_is_echoed() {
        let (_store, state, company) = test_state();
        let app = app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "/companies/{company}/ingest/ad-form?challenge=ping-123"
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ping-123");
    }

    #[tokio::test]
    async fn ingest_endpoint_reports_counts_and_stays_successful() {
        let (store, state, company) = test_state();
        store.register_agent(agent(company)).await.unwrap();
        let app = app(state);

        let payload = serde_json::json!([
            {"leadgen_id": "w-1", "full_name": "A", "phone_number": "971501111111"},
            {"leadgen_id": "w-2", "full_name": "B", "phone_number": "nope"}
        ]);
        let response = app
            .oneshot(post_json(
                &format!("/companies/{company}/ingest/ad-form"),
                payload,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["processed"], 2);
        assert_eq!(body["created"], 1);
        assert_eq!(body["errors"], 1);
    }

    #[tokio::test]
    async fn unknown_source_returns_bad_request() {
        let (_store, state, company) = test_state();
        let app = app(state);

        let response = app
            .oneshot(post_json(
                &format!("/companies/{company}/ingest/carrier-pigeon"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn assign_undo_and_priority_flow() {
        let (store, state, company) = test_state();
        let a = agent(company);
        store.register_agent(a.clone()).await.unwrap();
        let app = app(state);

        // Seed one lead via the manual-assignment path (no agents consulted
        // because the ingest endpoint auto-assigns; undo then reverts it).
        let payload = serde_json::json!({
            "leadgen_id": "flow-1",
            "full_name": "Fatima",
            "phone_number": "971501234567"
        });
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/companies/{company}/ingest/ad-form"),
                payload,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let leads = store.leads_for_company(company).await.unwrap();
        let lead_id = leads[0].id;
        assert_eq!(leads[0].assigned_agent_id, Some(a.agent_id));

        let response = app
            .clone()
            .oneshot(post_json(&format!("/leads/{lead_id}/undo"), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["undone"], true);
        assert_eq!(
            store.lead(lead_id).await.unwrap().assigned_agent_id,
            None
        );

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/leads/{lead_id}/priority"),
                serde_json::json!({ "priority": "urgent" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json(
                &format!("/leads/{lead_id}/priority"),
                serde_json::json!({ "priority": "critical" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn missing_lead_maps_to_not_found() {
        let (_store, state, _company) = test_state();
        let app = app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/leads/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rule_crud_round_trip() {
        let (_store, state, company) = test_state();
        let app = app(state);

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/companies/{company}/rules"),
                serde_json::json!({
                    "days_without_contact": 3,
                    "apply_to_stages": ["New"]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let rule_id = body["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/companies/{company}/rules"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let rules = body_json(response).await;
        assert_eq!(rules.as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/rules/{rule_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn portal_quarantine_and_retry_over_http() {
        let (store, state, company) = test_state();
        store.register_agent(agent(company)).await.unwrap();
        let app = app(state);

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/companies/{company}/portal/brightbricks"),
                serde_json::json!({ "client_name": "Hind", "listing_id": "APT-7" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["errors"], 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/companies/{company}/import-errors"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let errors = body_json(response).await;
        let error_id = errors[0]["id"].as_str().unwrap().to_string();
        assert_eq!(errors[0]["error_type"], "missing_phone");

        let response = app
            .oneshot(post_json(
                &format!("/import-errors/{error_id}/retry"),
                serde_json::json!({
                    "payload": {
                        "client_name": "Hind",
                        "contact_number": "971505556666",
                        "listing_id": "APT-7"
                    }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["created"], 1);
        assert_eq!(store.leads_for_company(company).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn notifications_read_state_transitions() {
        let (store, state, company) = test_state();
        store.register_agent(agent(company)).await.unwrap();
        let app = app(state);

        // An ingested lead produces an assignment notification.
        app.clone()
            .oneshot(post_json(
                &format!("/companies/{company}/ingest/ad-form"),
                serde_json::json!({
                    "leadgen_id": "n-1",
                    "full_name": "Omar",
                    "phone_number": "971501234567"
                }),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/companies/{company}/notifications"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let notifications = body_json(response).await;
        assert!(!notifications.as_array().unwrap().is_empty());
        assert_eq!(notifications[0]["is_read"], false);

        let response = app
            .oneshot(post_json(
                &format!("/companies/{company}/notifications/read-all"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["read"].as_u64().unwrap() >= 1);
        let unread = store
            .notifications_for_company(company)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| !n.is_read)
            .count();
        assert_eq!(unread, 0);
    }

    #[tokio::test]
    async fn availability_toggle_is_persisted() {
        let (store, state, company) = test_state();
        let a = agent(company);
        store.register_agent(a.clone()).await.unwrap();
        let app = app(state);

        let response = app
            .oneshot(post_json(
                &format!("/agents/{}/availability", a.agent_id),
                serde_json::json!({ "is_available": false }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!store.agent_load(a.agent_id).await.unwrap().is_available);
    }
}
