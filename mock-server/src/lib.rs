use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};

/// Header whose presence tells a long-poll client to stop.
pub const END_OF_STREAM_HEADER: &str = "x-end-of-stream";

/// Number of responses served so far, keyed by long-poll session name.
pub type Polls = Arc<Mutex<HashMap<String, u32>>>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Greeting {
    pub name: String,
    pub version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size: usize,
}

#[derive(Deserialize)]
pub struct SseParams {
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub interval_ms: u64,
}

#[derive(Deserialize)]
pub struct PollParams {
    pub session: String,
    #[serde(default = "default_count")]
    pub rounds: u32,
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_count() -> u32 {
    5
}

pub fn app() -> Router {
    let polls: Polls = Arc::new(Mutex::new(HashMap::new()));
    Router::new()
        .route("/text", get(text))
        .route("/json", get(json))
        .route("/form", get(form))
        .route("/cookies", get(cookies))
        .route("/headers", get(echo_headers).post(echo_headers))
        .route("/echo", post(echo))
        .route("/upload", post(upload))
        .route("/delay/{ms}", get(delay))
        .route("/status/{code}", get(status))
        .route("/sse", get(sse))
        .route("/poll", get(poll))
        .with_state(polls)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn text() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], "hello from courier")
}

async fn json() -> Json<Greeting> {
    Json(Greeting {
        name: "courier".to_string(),
        version: 1,
    })
}

async fn form() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/x-www-form-urlencoded")],
        "name=courier&kind=http+client",
    )
}

async fn cookies() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.append(
        header::SET_COOKIE,
        header::HeaderValue::from_static("session=abc123; Path=/; HttpOnly"),
    );
    headers.append(
        header::SET_COOKIE,
        header::HeaderValue::from_static("theme=dark; Max-Age=3600; Secure; SameSite=Lax"),
    );
    (headers, "cookies set")
}

/// Returns the request headers as a JSON object. Repeated headers are joined
/// with `", "`.
async fn echo_headers(headers: HeaderMap) -> Json<HashMap<String, String>> {
    let mut echoed: HashMap<String, String> = HashMap::new();
    for (name, value) in headers.iter() {
        let value = value.to_str().unwrap_or_default().to_string();
        echoed
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    Json(echoed)
}

/// Sends the request body back with the request's content type.
async fn echo(headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| header::HeaderValue::from_static("application/octet-stream"));
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

async fn upload(mut multipart: Multipart) -> Result<Json<Vec<UploadedPart>>, StatusCode> {
    let mut parts = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
        parts.push(UploadedPart {
            name,
            file_name,
            content_type,
            size: data.len(),
        });
    }
    Ok(Json(parts))
}

async fn delay(Path(ms): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "ok"
}

async fn status(Path(code): Path<u16>) -> Result<(StatusCode, String), StatusCode> {
    let status = StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok((status, format!("status {code}")))
}

/// Emits `count` events. The first one goes out immediately, each following
/// one after `interval_ms`.
async fn sse(Query(params): Query<SseParams>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let interval = Duration::from_millis(params.interval_ms);
    let count = params.count;
    let events = stream::unfold(0u32, move |sent| async move {
        if sent >= count {
            return None;
        }
        if sent > 0 {
            tokio::time::sleep(interval).await;
        }
        let event = Event::default()
            .id(sent.to_string())
            .event("tick")
            .data(format!("event {sent}"));
        Some((Ok(event), sent + 1))
    });
    Sse::new(events)
}

/// Answers `rounds` times with a payload, then with the end-of-stream header.
async fn poll(State(polls): State<Polls>, Query(params): Query<PollParams>) -> Response {
    tokio::time::sleep(Duration::from_millis(params.delay_ms)).await;
    let served = {
        let mut polls = polls.lock().await;
        let served = polls.entry(params.session).or_insert(0);
        *served += 1;
        *served
    };
    if served > params.rounds {
        return ([(END_OF_STREAM_HEADER, "1")], "").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain")],
        format!("message {served}"),
    )
        .into_response()
}
