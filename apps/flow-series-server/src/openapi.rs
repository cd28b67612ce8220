use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "flow-series-server",
        description = "Derived metric evaluation and time-series aggregation for flow meters"
    ),
    paths(
        crate::routes::health::healthz_handler,
        crate::routes::series::query_series,
        crate::routes::series::list_formulas
    ),
    components(schemas(
        crate::routes::health::HealthResponse,
        crate::routes::series::FormulaResponse,
        crate::services::series::types::VariableRequest,
        crate::services::series::types::SeriesRequest,
        crate::services::series::types::ResultPoint,
        crate::services::series::types::SeriesResult,
        crate::services::series::types::SeriesResponse,
        crate::time::TimeRangeSpec
    )),
    tags(
        (name = "series", description = "Widget series queries"),
        (name = "health", description = "Liveness")
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to serialize openapi document");
        serde_json::Value::Null
    })
}

async fn openapi_handler() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_handler))
}
