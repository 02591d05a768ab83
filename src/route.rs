//! Route definitions for the newsletter dispatch API
//!
//! This module configures all HTTP routes and maps them to their respective handlers.

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;

use crate::database::AppState;
use crate::handler::{
    create_newsletter, get_newsletter, get_newsletter_analytics, put_recipient_list,
    retry_chunk, send_newsletter, track_click, track_pixel,
};
use crate::middleware::auth_middleware;

/// Creates and configures the Axum application router with all routes
///
/// # Route Definitions
///
/// Operator routes (guarded by `auth_middleware`):
/// - `POST /newsletter` - Creates a draft campaign
/// - `GET /newsletter/{id}` - Campaign record and progress
/// - `GET /newsletter/{id}/analytics` - Opens and link clicks
/// - `POST /newsletter/send` - Sends the next chunk
/// - `POST /newsletter/retry-chunk` - Retries failed recipients
/// - `PUT /lists/{id}` - Stores a recipient list
///
/// Public routes:
/// - `GET /track/pixel/{token}` - Open pixel
/// - `GET /track/click/{token}` - Click redirect
///
/// # Example Usage
///
/// ```no_run
/// # use std::sync::Arc;
/// # use newsletter::config::Config;
/// # use newsletter::database::{init_db, AppState};
/// # use newsletter::route::create_app;
/// # use newsletter::transport::LogTransport;
/// # let db = init_db("data.db").unwrap();
/// let state = AppState {
///     db: Arc::new(db),
///     transport: Arc::new(LogTransport),
///     config: Arc::new(Config::default()),
/// };
/// let app = create_app(state);
/// // axum::serve(listener, app).await.unwrap();
/// ```
pub fn create_app(state: AppState) -> Router {
    let operator_routes = Router::new()
        .route("/newsletter", post(create_newsletter))
        .route("/newsletter/send", post(send_newsletter))
        .route("/newsletter/retry-chunk", post(retry_chunk))
        .route("/newsletter/{id}", get(get_newsletter))
        .route("/newsletter/{id}/analytics", get(get_newsletter_analytics))
        .route("/lists/{id}", put(put_recipient_list))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/track/pixel/{token}", get(track_pixel))
        .route("/track/click/{token}", get(track_click))
        .merge(operator_routes)
        .with_state(state)
}
