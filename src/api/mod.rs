use axum::Router;
use std::sync::Arc;

pub mod playback;
pub mod sessions;
pub mod users;

use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/Users", users::routes())
        .nest(
            "/Sessions",
            sessions::routes().merge(playback::routes()),
        )
}
