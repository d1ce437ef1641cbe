use std::net::SocketAddr;

use axum::http::Response;
use axum::routing::method_routing;
use axum::Router;
use axum_server::Server;
use prometheus::Encoder;

use crate::metrics::REGISTRY;

async fn prometheus_metrics() -> axum::response::Response {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        eprintln!("could not encode metrics: {}", e);
    }
    let body = String::from_utf8(buffer).unwrap_or_default();
    Response::new(body.into())
}

pub struct Prometheus {
    server: Server,
}

impl Prometheus {
    pub fn new(addr: SocketAddr) -> Self {
        let server = axum_server::bind(addr);
        Self { server }
    }

    pub async fn serve(self) -> std::io::Result<()> {
        let router = Router::new()
            .route("/metrics", method_routing::get(prometheus_metrics))
            .into_make_service();
        self.server.serve(router).await
    }
}
