//! HTTP host for counterd.
//!
//! The router is served with axum on top of the connection stream the
//! restart core hands to each listener, so accepting stops when the core
//! closes the listener and every request is counted as in flight.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{any, get},
    serve::ListenerExt,
    Router,
};
use counterd_ecdysis::{Generation, Handler, Incoming, TrackedStream};
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, info, trace, Level};

mod routes;

/// Per-request deadline for the service routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state of the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub generation: Arc<Generation>,
    /// Value served by `/`. Starts at zero in every generation.
    pub count: Arc<AtomicU64>,
    pub host: Arc<str>,
}

impl AppState {
    pub fn new(generation: Arc<Generation>, host: impl Into<Arc<str>>) -> Self {
        Self {
            generation,
            count: Arc::new(AtomicU64::new(0)),
            host: host.into(),
        }
    }
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    let service_routes = Router::new()
        .route("/", get(routes::count))
        .route("/dump", any(routes::dump))
        .route("/ping", get(routes::ping))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let ops_routes = Router::new()
        .route("/metrics", get(routes::metrics))
        .route("/debug/generation", get(routes::generation))
        .route("/debug/sleep", get(routes::sleep));

    Router::new()
        .merge(service_routes)
        .merge(ops_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_in_flight,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Count the request as in flight on this generation until it is answered.
async fn track_in_flight(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let _in_flight = state.generation.requests().enter();
    next.run(request).await
}

/// Serves the router on every listener it is attached to.
pub struct HttpHandler {
    router: Router,
}

impl HttpHandler {
    pub fn new(state: AppState) -> Self {
        Self {
            router: create_router(state),
        }
    }
}

#[async_trait]
impl Handler for HttpHandler {
    async fn serve(&self, incoming: Incoming) -> io::Result<()> {
        let addr = incoming.local_addr();
        let closed = incoming.closed();
        info!(%addr, "Starting Axum HTTP server");

        // `tap_io` also gives axum the `Connected` impl behind `ConnectInfo`.
        let listener = AxumIncoming(incoming).tap_io(|stream: &mut TrackedStream| {
            if let Err(e) = stream.get_ref().set_nodelay(true) {
                trace!(error = %e, "Failed to set TCP_NODELAY on incoming connection");
            }
        });

        axum::serve(
            listener,
            self.router
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            closed.cancelled().await;
            debug!(%addr, "HTTP server stopped accepting, finishing open connections");
        })
        .await
    }
}

/// Adapts the core's connection stream to axum's listener interface.
struct AxumIncoming(Incoming);

impl axum::serve::Listener for AxumIncoming {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.0.accept().await {
            Some(accepted) => accepted,
            // Closed listener: graceful shutdown takes over from here.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.0.local_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        extract::connect_info::MockConnectInfo,
        http::{header, Method, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let generation = Arc::new(Generation::new());
        generation.mark_ready().unwrap();
        AppState::new(generation, "test-host")
    }

    fn test_router(state: AppState) -> Router {
        create_router(state).layer(MockConnectInfo(SocketAddr::from(([10, 1, 2, 3], 4567))))
    }

    async fn body_string(response: Response) -> String {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_count_increments() {
        let state = test_state();
        let app = test_router(state.clone());

        let first = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(
            body_string(first).await,
            "host: test-host\ncount: 1\nremote: 10.1.2.3:4567\n"
        );

        let second = app.oneshot(get("/")).await.unwrap();
        assert!(body_string(second).await.contains("count: 2\n"));
    }

    #[tokio::test]
    async fn test_count_echoes_forwarded_for() {
        let app = test_router(test_state());
        let request = Request::builder()
            .uri("/")
            .header("X-Forwarded-For", "203.0.113.7")
            .body(Body::empty())
            .unwrap();

        let body = body_string(app.oneshot(request).await.unwrap()).await;
        assert!(body.ends_with("X-Forwarded-For: 203.0.113.7\n"), "{body}");
    }

    #[tokio::test]
    async fn test_ping_endpoint() {
        let app = test_router(test_state());
        let response = app.oneshot(get("/ping")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK\n");
    }

    #[tokio::test]
    async fn test_dump_returns_empty_ok() {
        let app = test_router(test_state());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/dump?x=1")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("hello"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_dump_oversized_body_fails() {
        let app = test_router(test_state());
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/dump")
            .body(Body::from(vec![b'x'; routes::MAX_DUMP_BODY + 1]))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = test_state();
        let app = test_router(state.clone());
        app.clone().oneshot(get("/")).await.unwrap();

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|h| h.to_str().ok()),
            Some("text/plain; version=0.0.4; charset=utf-8")
        );

        let metrics = body_string(response).await;
        assert!(metrics.contains("counterd_count 1\n"), "{metrics}");
        assert!(metrics.contains("counterd_generation 0\n"));
        // The scrape itself is in flight while rendering.
        assert!(metrics.contains("counterd_in_flight_requests 1\n"));
        assert!(metrics.contains("counterd_requests_total 2\n"));
    }

    #[tokio::test]
    async fn test_generation_endpoint() {
        let state = test_state();
        let app = test_router(state.clone());

        let response = app.oneshot(get("/debug/generation")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["generation"], 0);
        assert_eq!(json["pid"], std::process::id());
        assert_eq!(json["state"], "serving");
        assert_eq!(json["in_flight"], 1);
        assert_eq!(json["listeners"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_requests_are_tracked_in_flight() {
        let state = test_state();
        let app = test_router(state.clone());

        let slow = tokio::spawn(app.oneshot(get("/debug/sleep?ms=200")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.generation.active_requests(), 1);

        let response = slow.await.unwrap().unwrap();
        assert_eq!(body_string(response).await, "slept 200ms\n");
        assert_eq!(state.generation.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = test_router(test_state());
        let response = app.oneshot(get("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_handler_serves_attached_listener() {
        let state = test_state_starting();
        let generation = Arc::clone(&state.generation);
        let listener = generation.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        generation
            .attach(&listener, Arc::new(HttpHandler::new(state)))
            .unwrap();
        generation.mark_ready().unwrap();

        let url = format!("http://{}/", listener.local_addr());
        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert!(body.contains("count: 1\n"), "{body}");
        assert!(body.contains("remote: 127.0.0.1:"), "{body}");

        let drain = counterd_ecdysis::DrainController::new(Duration::from_secs(2));
        let outcome = drain.begin_drain(&generation, false).await.unwrap();
        assert_eq!(outcome, counterd_ecdysis::DrainOutcome::Completed);
        assert!(reqwest::get(&url).await.is_err());
    }

    fn test_state_starting() -> AppState {
        AppState::new(Arc::new(Generation::new()), "test-host")
    }
}
