pub mod auth;
pub mod conversations;
pub mod convert;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod receipts;

use std::sync::Arc;

use pigeon_db::Database;
use pigeon_gateway::dispatcher::Dispatcher;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

/// Run blocking DB work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("spawn_blocking join error: {}", e)))?
        .map_err(ApiError::Internal)
}
