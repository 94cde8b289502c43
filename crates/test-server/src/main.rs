use std::collections::HashMap;

use axum::{
    extract::Query,
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const API_KEY_NAME: &str = "private_token";
const API_KEY: &str = "super-duper-secret";

#[tokio::main]
async fn main() {
    let address =
        std::env::var("LISTENING_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app = Router::new()
        .route("/", get(|| async { "200" }))
        .route("/200", get(|| async { "200" }))
        .route("/404", get(|| async { (StatusCode::NOT_FOUND, "404") }))
        .route("/500", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "500") }))
        .route("/503", post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "503") }))
        .route("/200/api-key", get(api_key));

    let listener = TcpListener::bind(&address)
        .await
        .unwrap_or_else(|err| panic!("failed to listen on {address}: {err}"));
    tracing::info!("test server started on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.unwrap()
}

async fn api_key(Query(params): Query<HashMap<String, String>>) -> (StatusCode, &'static str) {
    if params.get(API_KEY_NAME).map(String::as_str) == Some(API_KEY) {
        (StatusCode::OK, "200")
    } else {
        (StatusCode::FORBIDDEN, "403")
    }
}
