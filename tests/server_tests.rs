mod support;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use camscan::onvif::OnvifScanner;
use camscan::server::router;
use camscan::DiscoveryService;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use support::FakeNet;
use tower::ServiceExt;

fn service() -> DiscoveryService {
    DiscoveryService::with_parts(
        Arc::new(FakeNet::new().open("10.0.0.2", &[80, 443, 554, 8080])),
        OnvifScanner::new().with_window(Duration::from_millis(50)),
    )
}

fn request(method: Method, uri: &str, body: Option<&str>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn unknown_session_is_404() {
    let app = router(service());
    for uri in [
        "/api/discovery/nope/progress",
        "/api/discovery/nope/results",
    ] {
        let resp = app
            .clone()
            .oneshot(request(Method::GET, uri, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
    }

    let resp = app
        .oneshot(request(Method::DELETE, "/api/discovery/nope", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn post_starts_session_and_lists_it() {
    let svc = service();
    let app = router(svc.clone());

    let resp = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/api/discovery",
            Some(r#"{"networkRange":"10.0.0.0/30","protocols":["http"],"portScanTimeout":50}"#),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let id = json_body(resp).await["sessionId"]
        .as_str()
        .unwrap()
        .to_string();

    let resp = app
        .clone()
        .oneshot(request(Method::GET, "/api/discovery", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let list = json_body(resp).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["id"], id.as_str());
    assert_eq!(list[0]["options"]["networkRange"], "10.0.0.0/30");

    let resp = app
        .clone()
        .oneshot(request(
            Method::GET,
            &format!("/api/discovery/{id}/progress"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let progress = json_body(resp).await;
    assert!(progress["progress"].as_u64().unwrap() <= 100);
    assert!(progress.get("phase").is_some());

    let resp = app
        .oneshot(request(Method::DELETE, &format!("/api/discovery/{id}"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(svc.sessions().await.is_empty());
}

#[tokio::test]
async fn invalid_options_are_400() {
    let app = router(service());
    let resp = app
        .oneshot(request(
            Method::POST,
            "/api/discovery",
            Some(r#"{"networkRange":"10.0.0.0/99"}"#),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(resp).await["error"]
        .as_str()
        .unwrap()
        .contains("invalid CIDR"));
}

#[tokio::test]
async fn results_are_served_after_completion() {
    let svc = service();
    svc.start(
        "done",
        serde_json::from_str(r#"{"networkRange":"10.0.0.0/30","protocols":["rtsp"]}"#).unwrap(),
    )
    .await
    .unwrap();

    let resp = router(svc)
        .oneshot(request(Method::GET, "/api/discovery/done/results", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["networkRange"], "10.0.0.0/30");
    assert_eq!(body["cameras"][0]["streamUrl"], "rtsp://10.0.0.2:554/stream1");
}
