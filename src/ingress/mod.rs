//! HTTP ingress facade.
//!
//! [`Ingress`] hands every request, whatever its method or path, to a single
//! [`RequestHandler`] and returns the handler's response untouched. It owns
//! no routing or business logic; that lives in the handler.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::response::IntoResponse;
use axum::Router;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Handles requests arriving at the ingress.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request<Bytes>) -> Response<Bytes>;
}

/// Request/response passthrough to one handler.
#[derive(Clone)]
pub struct Ingress {
    handler: Arc<dyn RequestHandler>,
}

impl Ingress {
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self { handler }
    }

    /// Forward a request to the handler.
    #[tracing::instrument(name = "ingress.request", skip_all, fields(method = %request.method(), path = %request.uri().path()))]
    pub async fn forward(&self, request: Request<Bytes>) -> Response<Bytes> {
        let response = self.handler.handle(request).await;
        info!(status = response.status().as_u16(), "Request handled");
        response
    }

    /// Axum router sending every request to [`Ingress::forward`].
    pub fn router(self) -> Router {
        Router::new().fallback(move |request: Request<Body>| {
            let ingress = self.clone();
            async move { ingress.forward_body(request).await }
        })
    }

    async fn forward_body(&self, request: Request<Body>) -> axum::response::Response {
        let (parts, body) = request.into_parts();
        let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to read request body");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };
        let response = self.forward(Request::from_parts(parts, bytes)).await;
        response.map(Body::from).into_response()
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    pub async fn serve(
        self,
        addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Ingress listening");
        axum::serve(listener, self.router().layer(TraceLayer::new_for_http()))
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Plain-text response helper.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Bytes> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}
