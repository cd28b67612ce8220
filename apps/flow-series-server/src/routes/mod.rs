pub mod health;
pub mod series;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(series::router())
                .merge(crate::openapi::router()),
        )
        .with_state(state)
}
