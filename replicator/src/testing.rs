//! Extras that only show up during tests.
#![allow(missing_docs)]

use std::time::Duration;

use http::{Request, Response, StatusCode};
use k8s_openapi::api::core::v1::Namespace;
use kube::{Resource, client::Body};
use serde_json::{Value, json};
use tower_test::mock::{Handle, SendResponse};

use crate::Context;

pub type ApiServerHandle = Handle<Request<Body>, Response<Body>>;

/// Mock_client returns a client wired to an in-process mock apiserver.
pub fn mock_client() -> (kube::Client, ApiServerHandle) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let client = kube::Client::new(mock_service, "default");
    (client, handle)
}

/// Context returns a test Context whose client must never be called; a call
/// would park forever and trip the test timeout.
pub fn context() -> Context {
    let (client, handle) = mock_client();
    std::mem::forget(handle);
    Context {
        client,
        allow_all: false,
        resync: Duration::from_secs(1800),
        cluster_domain: "cluster.local".into(),
    }
}

/// ApiServer wraps the mock handle with request assertions.
///
/// NB: if the engine makes more calls than the scenario handles, the test
/// hangs on the un-serviced mock and the scenario timeout catches it; if it
/// makes fewer, the scenario task itself times out waiting for the request.
pub struct ApiServer {
    handle: ApiServerHandle,
}

impl ApiServer {
    pub fn new(handle: ApiServerHandle) -> ApiServer {
        ApiServer { handle }
    }

    /// Expect asserts the next request's method and path, returning its JSON
    /// body (Null for bodiless requests) and the response slot.
    pub async fn expect(
        &mut self,
        method: &str,
        path: &str,
    ) -> (Value, SendResponse<Response<Body>>) {
        let (request, send) = self.handle.next_request().await.expect("service not called");
        eprintln!("{}\t{}", request.method(), request.uri());
        assert_eq!(request.method().as_str(), method, "unexpected method for {path}");
        assert_eq!(request.uri().path(), path, "unexpected path");
        let bytes = request
            .into_body()
            .collect_bytes()
            .await
            .expect("collect request body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("request body is json")
        };
        (body, send)
    }
}

/// Respond sends `body` back as the apiserver would.
pub fn respond<T: serde::Serialize>(send: SendResponse<Response<Body>>, body: &T) {
    let bytes = serde_json::to_vec(body).expect("serializable response");
    send.send_response(Response::builder().body(Body::from(bytes)).expect("response"));
}

/// Respond_not_found sends the Status document for a missing `K`.
pub fn respond_not_found<K: Resource<DynamicType = ()>>(
    send: SendResponse<Response<Body>>,
    name: &str,
) {
    let err = json!({
        "code": 404,
        "status": "Failure",
        "reason": "NotFound",
        "details": {
            "group": K::group(&()),
            "kind": K::kind(&()),
            "name": name,
        },
    });
    let bytes = serde_json::to_vec(&err).expect("serializable status");
    send.send_response(
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from(bytes))
            .expect("response"),
    );
}

/// Namespace builds a Namespace with labels.
pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    let mut ns = Namespace::default();
    ns.metadata.name = Some(name.to_string());
    if !labels.is_empty() {
        ns.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
    ns
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}
