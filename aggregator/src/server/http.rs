//! Admin HTTP server for health checks and metrics

use crate::audit;
use crate::metrics;
use crate::storage::Storage;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Start the admin HTTP server serving /healthz, /readyz, and /metrics.
/// Returns once `shutdown` resolves.
pub async fn serve_admin(
    addr: SocketAddr,
    storage: Arc<Storage>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let storage = storage.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let storage = storage.clone();
                async move { Ok::<_, hyper::Error>(handle(&req, &storage)) }
            }))
        }
    });

    tracing::info!("Admin HTTP server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await
}

fn handle(req: &Request<Body>, storage: &Storage) -> Response<Body> {
    let path = req.uri().path();
    let (status, content_type, body) = match path {
        "/healthz" => (StatusCode::OK, "text/plain", "ok\n".to_string()),
        "/readyz" if storage.is_closing() => (
            StatusCode::SERVICE_UNAVAILABLE,
            "text/plain",
            "closing\n".to_string(),
        ),
        "/readyz" => (StatusCode::OK, "text/plain", "ready\n".to_string()),
        "/metrics" => (
            StatusCode::OK,
            "text/plain; version=0.0.4",
            metrics::encode_metrics(),
        ),
        _ => (StatusCode::NOT_FOUND, "text/plain", "not found\n".to_string()),
    };

    if status != StatusCode::NOT_FOUND {
        audit::admin_http_request(path, status.as_u16());
    }
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::DataSource;
    use tempfile::TempDir;

    fn storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            rollup_capped_store_sizes_mb: vec![1; 4],
            trace_capped_store_size_mb: 1,
            ..Default::default()
        };
        let storage =
            Storage::open_with(&config, DataSource::open_in_memory().unwrap(), dir.path()).unwrap();
        (dir, storage)
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_health_and_readiness() {
        let (_dir, storage) = storage();
        assert_eq!(handle(&get("/healthz"), &storage).status(), StatusCode::OK);
        assert_eq!(handle(&get("/readyz"), &storage).status(), StatusCode::OK);
        assert_eq!(handle(&get("/nope"), &storage).status(), StatusCode::NOT_FOUND);

        storage.close();
        assert_eq!(
            handle(&get("/readyz"), &storage).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_metrics_content_type() {
        let (_dir, storage) = storage();
        let response = handle(&get("/metrics"), &storage);
        assert_eq!(
            response.headers()[hyper::header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }
}
