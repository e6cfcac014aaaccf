use axum::http::{self, Request, StatusCode};
use http_body_util::BodyExt;
use mock_server::{app, Greeting, END_OF_STREAM_HEADER};
use tower::ServiceExt;

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn get(uri: &str) -> Request<String> {
    Request::builder().uri(uri).body(String::new()).unwrap()
}

// --- content ---

#[tokio::test]
async fn text_is_plain() {
    let resp = app().oneshot(get("/text")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "text/plain");
    assert_eq!(&body_bytes(resp).await[..], b"hello from courier");
}

#[tokio::test]
async fn json_returns_greeting() {
    let resp = app().oneshot(get("/json")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let greeting: Greeting = body_json(resp).await;
    assert_eq!(greeting.name, "courier");
    assert_eq!(greeting.version, 1);
}

#[tokio::test]
async fn echo_preserves_content_type() {
    let resp = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo")
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(r#"{"a":1}"#.to_string())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "application/json");
    assert_eq!(&body_bytes(resp).await[..], br#"{"a":1}"#);
}

#[tokio::test]
async fn headers_are_echoed_as_json() {
    let resp = app()
        .oneshot(
            Request::builder()
                .uri("/headers")
                .header("x-custom", "yes")
                .body(String::new())
                .unwrap(),
        )
        .await
        .unwrap();

    let headers: std::collections::HashMap<String, String> = body_json(resp).await;
    assert_eq!(headers["x-custom"], "yes");
}

#[tokio::test]
async fn cookies_sets_two_cookies() {
    let resp = app().oneshot(get("/cookies")).await.unwrap();

    let cookies: Vec<_> = resp.headers().get_all(http::header::SET_COOKIE).iter().collect();
    assert_eq!(cookies.len(), 2);
}

// --- status ---

#[tokio::test]
async fn status_returns_requested_code() {
    let resp = app().oneshot(get("/status/418")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn status_rejects_invalid_code() {
    let resp = app().oneshot(get("/status/1000")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// --- streaming ---

#[tokio::test]
async fn sse_emits_requested_events() {
    let resp = app().oneshot(get("/sse?count=3")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "text/event-stream");
    let body = String::from_utf8(body_bytes(resp).await.to_vec()).unwrap();
    assert_eq!(body.matches("data: ").count(), 3);
    assert!(body.contains("data: event 2"));
}

#[tokio::test]
async fn poll_ends_with_sentinel_after_rounds() {
    let app = app();

    for round in 1..=2 {
        let resp = app
            .clone()
            .oneshot(get("/poll?session=s1&rounds=2"))
            .await
            .unwrap();
        assert!(resp.headers().get(END_OF_STREAM_HEADER).is_none());
        assert_eq!(body_bytes(resp).await, format!("message {round}"));
    }

    let resp = app.oneshot(get("/poll?session=s1&rounds=2")).await.unwrap();
    assert_eq!(resp.headers()[END_OF_STREAM_HEADER], "1");
}

#[tokio::test]
async fn poll_sessions_are_independent() {
    let app = app();

    let resp = app
        .clone()
        .oneshot(get("/poll?session=a&rounds=1"))
        .await
        .unwrap();
    assert!(resp.headers().get(END_OF_STREAM_HEADER).is_none());

    let resp = app.oneshot(get("/poll?session=b&rounds=1")).await.unwrap();
    assert!(resp.headers().get(END_OF_STREAM_HEADER).is_none());
}
