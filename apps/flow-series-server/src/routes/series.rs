use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;

use crate::auth::Scope;
use crate::error::AppError;
use crate::services::series::formulas::FormulaRule;
use crate::services::series::types::{SeriesRequest, SeriesResponse};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FormulaResponse {
    tag: String,
    kind: String,
    required_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expression: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/widgets/series",
    tag = "series",
    request_body = SeriesRequest,
    params(
        ("x-company-id" = String, Header, description = "Company scope set by the gateway"),
        ("x-device-type-id" = String, Header, description = "Device type scope set by the gateway")
    ),
    responses(
        (status = 200, description = "Series keyed by variable name", body = SeriesResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Missing scope"),
        (status = 404, description = "Hierarchy not found"),
        (status = 502, description = "Reading store unavailable"),
        (status = 503, description = "Cancelled"),
        (status = 504, description = "Timed out")
    )
)]
pub(crate) async fn query_series(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Json(request): Json<SeriesRequest>,
) -> Result<Json<SeriesResponse>, AppError> {
    let cancel = state.shutdown.child_token();
    let response = state
        .series
        .query(&scope, &request, Utc::now(), &cancel)
        .await?;
    tracing::debug!(
        widget_id = %request.widget_id,
        company_id = %scope.company_id,
        variables = response.series_data.len(),
        "served series request"
    );
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/formulas",
    tag = "series",
    params(
        ("x-company-id" = String, Header, description = "Company scope set by the gateway"),
        ("x-device-type-id" = String, Header, description = "Device type scope set by the gateway")
    ),
    responses(
        (status = 200, description = "Registered derived metrics", body = Vec<FormulaResponse>),
        (status = 401, description = "Missing scope")
    )
)]
pub(crate) async fn list_formulas(
    State(state): State<AppState>,
    Scope(_scope): Scope,
) -> Json<Vec<FormulaResponse>> {
    let formulas = state
        .series
        .formulas()
        .definitions()
        .into_iter()
        .map(|definition| FormulaResponse {
            tag: definition.tag().to_string(),
            kind: definition.kind().to_string(),
            required_fields: definition.required_fields().to_vec(),
            expression: match definition.rule() {
                FormulaRule::Expression(compiled) => Some(compiled.source().to_string()),
                FormulaRule::Ratio { .. } => None,
            },
        })
        .collect();
    Json(formulas)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/widgets/series", post(query_series))
        .route("/formulas", get(list_formulas))
}
