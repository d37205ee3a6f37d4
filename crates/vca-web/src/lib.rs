//! Axum JSON API for VCA.

pub mod error;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::info;
use vca_core::{
    Capability, CapabilityUpdate, EntryDetails, Initiative, Submission, ValidationError, ValueChain,
    ValueChainEntry, ValueChainInput,
};
use vca_reconcile::{
    maturity::MaturityLevels, AssessmentService, BuyOrBuildSuggestion, Frame, MaturityLookup,
    ResolvedCapabilities,
};
use vca_sheets::SheetTable;
use vca_sync::{build_scheduler, connect_store, import_table, AppConfig, SheetSyncPipeline};

pub use error::{ApiError, ApiResult};

pub const CRATE_NAME: &str = "vca-web";

#[derive(Clone)]
pub struct AppState {
    pub service: AssessmentService,
}

impl AppState {
    pub fn new(service: AssessmentService) -> Self {
        Self { service }
    }
}

type SharedState = State<Arc<AppState>>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/valuechainentry", post(upsert_entry_handler))
        .route("/api/valuechainentries", get(list_entries_handler))
        .route("/api/valuechains", post(upsert_value_chains_handler))
        .route("/api/valuechains/{entry_id}", get(list_value_chains_handler))
        .route("/api/capabilities/{value_chain_id}", get(list_capabilities_handler))
        .route("/api/capabilities/entry/{entry_name}", get(list_entry_capabilities_handler))
        .route("/api/capability", post(upsert_capability_handler))
        .route("/api/updateCapability", post(update_capability_handler))
        .route("/api/resolveCapabilities", post(resolve_capabilities_handler))
        .route("/api/valuechainmaster", get(value_chain_master_handler))
        .route("/api/maturity", get(maturity_handler))
        .route("/api/maturity/levels", get(maturity_levels_handler))
        .route("/api/initiative", post(upsert_initiative_handler))
        .route("/api/initiatives/{entry_name}", get(list_initiatives_handler))
        .route("/api/buyorbuild", post(buy_or_build_handler))
        .route("/api/submission/{entry_id}", get(submission_handler))
        .route("/api/mongo/read", get(read_sheet_query_handler).post(read_sheet_body_handler))
        .route("/api/mongo/push", post(push_sheet_handler))
        .route("/api/deleteAll", post(delete_all_handler))
        .with_state(Arc::new(state))
}

/// Binds the API, starting the sheet-sync scheduler first when it is enabled.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let pipeline = Arc::new(SheetSyncPipeline::new(config.clone(), store.clone())?);
    let scheduler = build_scheduler(pipeline).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting sheet sync scheduler")?;
        info!(cron = %config.sheet_sync_cron, "sheet sync scheduler started");
    }

    let state = AppState::new(AssessmentService::new(store));
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "vca api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

/// Parses a JSON body, turning both syntax and shape errors into 400s.
fn parse_body<T: DeserializeOwned>(body: Result<Json<JsonValue>, JsonRejection>) -> ApiResult<T> {
    let Json(value) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    serde_json::from_value(value).map_err(|err| ApiError::BadRequest(err.to_string()))
}

fn require(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::missing(field).into());
    }
    Ok(())
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EntryRequest {
    name: String,
    business_type: String,
    label: String,
    business_complexity: Option<JsonValue>,
    annual_revenues: Option<JsonValue>,
}

async fn upsert_entry_handler(
    State(state): SharedState,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let req: EntryRequest = parse_body(body)?;
    let details = EntryDetails {
        business_complexity: req.business_complexity,
        annual_revenues: req.annual_revenues,
    };
    let id = state
        .service
        .hierarchy()
        .upsert_value_chain_entry(&req.name, &req.business_type, &req.label, &details)
        .await?;
    Ok(Json(json!({ "success": true, "_id": id })))
}

async fn list_entries_handler(State(state): SharedState) -> ApiResult<Json<Vec<ValueChainEntry>>> {
    Ok(Json(state.service.hierarchy().entries().await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ValueChainsRequest {
    value_chain_entry_id: String,
    value_chain_entry_name: String,
    value_chains: Vec<ValueChainInput>,
}

async fn upsert_value_chains_handler(
    State(state): SharedState,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let req: ValueChainsRequest = parse_body(body)?;
    let counts = state
        .service
        .hierarchy()
        .upsert_value_chains(&req.value_chain_entry_id, &req.value_chain_entry_name, &req.value_chains)
        .await?;
    Ok(Json(json!({
        "success": true,
        "insertedCount": counts.inserted_count,
        "updatedCount": counts.updated_count,
    })))
}

async fn list_value_chains_handler(
    State(state): SharedState,
    AxumPath(entry_id): AxumPath<String>,
) -> ApiResult<Json<Vec<ValueChain>>> {
    Ok(Json(state.service.hierarchy().value_chains_for_entry(&entry_id).await?))
}

async fn list_capabilities_handler(
    State(state): SharedState,
    AxumPath(value_chain_id): AxumPath<String>,
) -> ApiResult<Json<Vec<Capability>>> {
    Ok(Json(state.service.capabilities_for_value_chain(&value_chain_id).await?))
}

async fn list_entry_capabilities_handler(
    State(state): SharedState,
    AxumPath(entry_name): AxumPath<String>,
) -> ApiResult<Json<Vec<Capability>>> {
    Ok(Json(state.service.capabilities().list_for_entry(&entry_name).await?))
}

async fn upsert_capability_handler(
    State(state): SharedState,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let update: CapabilityUpdate = parse_body(body)?;
    let outcome = state.service.assess(update).await?;
    Ok(Json(json!({ "success": true, "_id": outcome.id, "created": outcome.created })))
}

async fn update_capability_handler(
    State(state): SharedState,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let update: CapabilityUpdate = parse_body(body)?;
    let outcome = state.service.capabilities().update_existing(&update).await?;
    Ok(Json(json!({ "success": true, "_id": outcome.id })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ResolveRequest {
    value_chain_names: Vec<String>,
    business_type: String,
}

async fn resolve_capabilities_handler(
    State(state): SharedState,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<ResolvedCapabilities>> {
    let req: ResolveRequest = parse_body(body)?;
    let resolved = state
        .service
        .resolver()
        .resolve_capabilities(&req.value_chain_names, &req.business_type)
        .await?;
    Ok(Json(resolved))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BusinessTypeQuery {
    business_type: String,
}

async fn value_chain_master_handler(
    State(state): SharedState,
    Query(query): Query<BusinessTypeQuery>,
) -> ApiResult<Json<Vec<Frame>>> {
    require("businessType", &query.business_type)?;
    Ok(Json(state.service.resolver().value_chains_for(&query.business_type).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MaturityQuery {
    business: String,
    technology: String,
}

async fn maturity_handler(
    State(state): SharedState,
    Query(query): Query<MaturityQuery>,
) -> ApiResult<Json<MaturityLookup>> {
    Ok(Json(state.service.maturity(&query.business, &query.technology).await?))
}

async fn maturity_levels_handler(State(state): SharedState) -> ApiResult<Json<MaturityLevels>> {
    Ok(Json(state.service.maturity_mapper().await?.levels()))
}

async fn upsert_initiative_handler(
    State(state): SharedState,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let initiative: Initiative = parse_body(body)?;
    let id = state.service.initiatives().upsert_initiative(&initiative).await?;
    Ok(Json(json!({ "success": true, "_id": id })))
}

async fn list_initiatives_handler(
    State(state): SharedState,
    AxumPath(entry_name): AxumPath<String>,
) -> ApiResult<Json<Vec<Initiative>>> {
    Ok(Json(state.service.initiatives().initiatives_for(&entry_name).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BuyOrBuildRequest {
    capability_names: Vec<String>,
    industry: String,
}

async fn buy_or_build_handler(
    State(state): SharedState,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<Vec<BuyOrBuildSuggestion>>> {
    let req: BuyOrBuildRequest = parse_body(body)?;
    Ok(Json(
        state
            .service
            .suggestions_for(&req.capability_names, &req.industry)
            .await?,
    ))
}

async fn submission_handler(
    State(state): SharedState,
    AxumPath(entry_id): AxumPath<String>,
) -> ApiResult<Json<Submission>> {
    Ok(Json(state.service.project_submission(&entry_id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SheetRequest {
    sheet_name: String,
}

async fn read_sheet(state: &AppState, sheet_name: &str) -> ApiResult<Json<JsonValue>> {
    require("sheetName", sheet_name)?;
    let table = state.service.catalog().load(sheet_name).await?;
    let records = table.records();
    Ok(Json(json!({
        "success": true,
        "sheetName": table.sheet_name,
        "headers": table.headers,
        "data": records,
    })))
}

async fn read_sheet_query_handler(
    State(state): SharedState,
    Query(query): Query<SheetRequest>,
) -> ApiResult<Json<JsonValue>> {
    read_sheet(&state, &query.sheet_name).await
}

async fn read_sheet_body_handler(
    State(state): SharedState,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let req: SheetRequest = parse_body(body)?;
    read_sheet(&state, &req.sheet_name).await
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PushRequest {
    sheet_name: String,
    data: JsonValue,
}

async fn push_sheet_handler(
    State(state): SharedState,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let req: PushRequest = parse_body(body)?;
    require("sheetName", &req.sheet_name)?;
    if req.data.is_null() {
        return Err(ValidationError::missing("data").into());
    }
    let table = SheetTable::from_payload(&req.sheet_name, &req.data)?;
    let report = import_table(state.service.catalog(), &table).await?;
    Ok(Json(json!({
        "success": true,
        "sheetName": report.sheet_name,
        "version": report.version,
        "rowCount": report.row_count,
        "unchanged": report.unchanged,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeleteAllRequest {
    collection: String,
}

async fn delete_all_handler(
    State(state): SharedState,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let req: DeleteAllRequest = parse_body(body)?;
    require("collection", &req.collection)?;
    let deleted = state.service.delete_all(&req.collection).await?;
    Ok(Json(json!({ "success": true, "deletedCount": deleted })))
}
