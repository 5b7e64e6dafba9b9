//! A mock Kubernetes API for reconciler tests, built on the tower mock
//! service that the kube client test harness uses. Tests answer requests
//! one at a time and assert on the method, path and payload the reconciler
//! produced.

use http::{Request, Response};
use http_body_util::BodyExt;
use kube::client::Body;
use kube::Client;
use tower_test::mock::{self, Handle};

pub(crate) type ApiHandle = Handle<Request<Body>, Response<Body>>;

/// A client wired to a mock service, plus the handle used to answer its
/// requests.
pub(crate) fn mock_client() -> (Client, ApiHandle) {
    let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(service, "default"), handle)
}

/// Answers the next request with `status` and `body`; returns the
/// request's method, path and decoded payload for assertions.
pub(crate) async fn handle_next(
    handle: &mut ApiHandle,
    status: u16,
    body: serde_json::Value,
) -> (String, String, serde_json::Value) {
    let (request, send) = handle.next_request().await.expect("expected an api request");
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let bytes = request
        .into_body()
        .collect()
        .await
        .expect("request body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("request payload is json")
    };
    send.send_response(
        Response::builder()
            .status(status)
            .body(Body::from(serde_json::to_vec(&body).expect("response json")))
            .expect("response"),
    );
    (method, path, payload)
}

/// A Status body reporting that `name` already exists.
pub(crate) fn already_exists_status(name: &str) -> serde_json::Value {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("{} already exists", name),
        "reason": "AlreadyExists",
        "code": 409,
    })
}
