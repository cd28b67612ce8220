use crate::config::ServerConfig;
use crate::services::series::SeriesEngine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub series: Arc<SeriesEngine>,
    /// Cancelled on shutdown; request tokens are children of it.
    pub shutdown: CancellationToken,
}
