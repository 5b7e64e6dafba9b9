use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
    Request, Response,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tokio::net::TcpListener;

pub(crate) fn metric_name(name: &str) -> String {
    format!("multitenancy_{}", name)
}

async fn serve_req(
    _req: Request<Incoming>,
    registry: Arc<Registry>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => Response::builder()
            .status(200)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Full::new(Bytes::from(buffer))),
        Err(e) => {
            error!("{}", e);
            Response::builder()
                .status(500)
                .body(Full::new(Bytes::new()))
        }
    }
}

/// Serves the metrics gathered in `registry` on `listener` until the
/// process exits.
pub(crate) async fn start_prometheus_metrics_server(
    listener: TcpListener,
    registry: Registry,
) -> anyhow::Result<()> {
    let registry = Arc::new(registry);
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let registry = registry.clone();
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(|req| serve_req(req, registry.clone())))
                .await
            {
                warn!("error serving metrics connection: {:?}", err);
            }
        });
    }
}
