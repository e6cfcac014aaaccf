//! Single-call pipeline behaviour against the live mock server.

mod common;

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use courier_core::{
    Authentication, CallError, CancellationToken, Completion, ContentDescriptor, ContentValue, Engine,
    Json, MultipartBody, Processor, ProvidedClient, RequestDescriptor, TextEncoding, WireBody,
};
use mock_server::{Greeting, UploadedPart};
use serde_json::json;

use common::{spawn_server, url};

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entry(log: &Log, what: &str) {
    log.lock().unwrap().push(what.to_string());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn recorded(descriptor: RequestDescriptor, log: &Log) -> RequestDescriptor {
    let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
    descriptor
        .on_pre_set_content(move |_| entry(&a, "pre_set_content"))
        .on_pre_send(move |_| entry(&b, "pre_send"))
        .on_post_send(move |_| entry(&c, "post_send"))
        .on_send_failed(move |err, _| entry(&d, &format!("send_failed: {err}")))
}

#[tokio::test]
async fn hooks_run_in_order() {
    let addr = spawn_server();
    let log = log();
    let status_log = log.clone();
    let descriptor = recorded(RequestDescriptor::get(&url(addr, "/text")), &log)
        .on_status(&[200], move |_| entry(&status_log, "status 200"))
        .ensure_success(true);

    let result = Engine::default()
        .execute::<String>(&descriptor, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.value, "hello from courier");
    assert_eq!(entries(&log), ["pre_set_content", "pre_send", "status 200", "post_send"]);
}

#[tokio::test]
async fn text_result_carries_response_metadata() {
    let addr = spawn_server();
    let result = Engine::default()
        .execute::<String>(&RequestDescriptor::get(&url(addr, "/text")), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status_code, 200);
    assert!(result.is_success);
    assert_eq!(result.content_type.as_deref(), Some("text/plain"));
    assert_eq!(result.char_set, None);
    assert_eq!(result.content_length, Some("hello from courier".len() as u64));
}

#[tokio::test]
async fn json_materializes_into_typed_value() {
    let addr = spawn_server();
    let result = Engine::default()
        .execute::<Json<Greeting>>(&RequestDescriptor::get(&url(addr, "/json")), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        result.value.0,
        Greeting {
            name: "courier".to_string(),
            version: 1,
        }
    );
    assert_eq!(result.content_type.as_deref(), Some("application/json"));
}

#[tokio::test]
async fn form_body_materializes_as_object() {
    let addr = spawn_server();
    let result = Engine::default()
        .execute::<serde_json::Value>(&RequestDescriptor::get(&url(addr, "/form")), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.value, json!({"name": "courier", "kind": "http client"}));
}

#[tokio::test]
async fn set_cookies_are_parsed() {
    let addr = spawn_server();
    let result = Engine::default()
        .execute::<String>(&RequestDescriptor::get(&url(addr, "/cookies")), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.raw_set_cookies.len(), 2);
    assert_eq!(result.cookies[0].name, "session");
    assert_eq!(result.cookies[0].value, "abc123");
    assert!(result.cookies[0].http_only);
    assert_eq!(result.cookies[1].max_age, Some(3600));
    assert_eq!(result.cookies[1].same_site.as_deref(), Some("Lax"));
}

#[tokio::test]
async fn headers_cookies_and_auth_reach_the_server() {
    let addr = spawn_server();
    let descriptor = RequestDescriptor::get(&url(addr, "/headers"))
        .header("X-Custom", "1")
        .header("X-Gone", "v")
        .remove_header("x-gone")
        .cookie("a", "1")
        .cookie("b", "2")
        .trace_id("trace-42")
        .auth(Authentication::Basic {
            username: "user".to_string(),
            password: Some("pass".to_string()),
        });

    let echoed = Engine::default()
        .execute::<Json<std::collections::HashMap<String, String>>>(&descriptor, &CancellationToken::new())
        .await
        .unwrap()
        .value
        .0;

    assert_eq!(echoed["x-custom"], "1");
    assert!(!echoed.contains_key("x-gone"));
    assert_eq!(echoed["cookie"], "a=1; b=2");
    assert_eq!(echoed["x-trace-id"], "trace-42");
    assert_eq!(echoed["authorization"], "Basic dXNlcjpwYXNz");
    assert!(echoed["user-agent"].starts_with("courier/"));
}

#[tokio::test]
async fn path_and_query_bindings() {
    let addr = spawn_server();
    let descriptor = RequestDescriptor::get(&url(addr, "/status/{code}")).path_param("code", 201);
    let message = Engine::default()
        .send(&descriptor, Completion::ContentRead, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(message.status.as_u16(), 201);
    assert_eq!(message.body().map(|b| &b[..]), Some(&b"status 201"[..]));
}

#[tokio::test]
async fn json_content_round_trips_through_echo() {
    let addr = spawn_server();
    let descriptor = RequestDescriptor::post(&url(addr, "/echo"))
        .content(ContentDescriptor::json(json!({"a": 1, "b": [true, null]})));

    let result = Engine::default()
        .execute::<serde_json::Value>(&descriptor, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.value, json!({"a": 1, "b": [true, null]}));
}

#[tokio::test]
async fn explicit_encoding_is_sent_and_decoded() {
    let addr = spawn_server();
    let descriptor = RequestDescriptor::post(&url(addr, "/echo"))
        .content(ContentDescriptor::text("café").with_encoding(TextEncoding::Latin1));

    let result = Engine::default()
        .execute::<Bytes>(&descriptor, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(&result.value[..], &[b'c', b'a', b'f', 0xE9]);
    assert_eq!(result.char_set.as_deref(), Some("iso-8859-1"));

    let text = Engine::default()
        .execute::<String>(&descriptor, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text.value, "café");
}

#[tokio::test]
async fn pre_set_content_hook_rewrites_the_body() {
    let addr = spawn_server();
    let descriptor = RequestDescriptor::post(&url(addr, "/echo"))
        .content(ContentDescriptor::text("original"))
        .on_pre_set_content(|content| content.value = Some(ContentValue::Text("rewritten".to_string())));

    let result = Engine::default()
        .execute::<String>(&descriptor, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.value, "rewritten");
    // The caller's descriptor is untouched.
    assert!(matches!(&descriptor.content.value, Some(ContentValue::Text(t)) if t == "original"));
}

#[tokio::test]
async fn caller_processor_overrides_builtin() {
    let addr = spawn_server();
    let engine = Engine::builder()
        .processor(Processor::new(
            "shouting-text",
            |value, media| matches!(value, ContentValue::Text(_)) && media.is("text/plain"),
            |value, _, _| match value {
                ContentValue::Text(text) => Ok(WireBody::Bytes {
                    data: Bytes::from(text.to_uppercase()),
                    content_type: Some("text/plain".to_string()),
                }),
                _ => unreachable!(),
            },
        ))
        .build();
    let descriptor = RequestDescriptor::post(&url(addr, "/echo")).content(ContentDescriptor::text("quiet"));

    let result = engine.execute::<String>(&descriptor, &CancellationToken::new()).await.unwrap();
    assert_eq!(result.value, "QUIET");
}

#[tokio::test]
async fn status_handlers_run_before_ensure_success() {
    let addr = spawn_server();
    let log = log();
    let (first, second) = (log.clone(), log.clone());
    let descriptor = recorded(RequestDescriptor::get(&url(addr, "/status/404")), &log)
        .on_status(&[404], move |_| entry(&first, "404 handler"))
        .on_status(&[404, 500], move |_| entry(&second, "404/500 handler"))
        .on_status(&[500], |_| panic!("wrong status handler"))
        .ensure_success(true);

    let err = Engine::default()
        .execute::<String>(&descriptor, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::NonSuccessStatus { status: 404, .. }));
    assert_eq!(
        entries(&log),
        [
            "pre_set_content",
            "pre_send",
            "404 handler",
            "404/500 handler",
            "send_failed: HTTP 404: Not Found",
        ]
    );
}

#[tokio::test]
async fn non_success_without_ensure_is_a_result() {
    let addr = spawn_server();
    let log = log();
    let descriptor = recorded(RequestDescriptor::get(&url(addr, "/status/503")), &log);

    let result = Engine::default()
        .execute::<String>(&descriptor, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status_code, 503);
    assert!(!result.is_success);
    assert_eq!(result.value, "status 503");
    assert_eq!(entries(&log), ["pre_set_content", "pre_send", "post_send"]);
}

#[tokio::test]
async fn materialization_failures_run_the_failure_hook() {
    let addr = spawn_server();
    let log = log();
    let descriptor = recorded(RequestDescriptor::post(&url(addr, "/echo")), &log)
        .content(ContentDescriptor::new(ContentValue::Text("not json".to_string()), "application/json"));

    let err = Engine::default()
        .execute::<serde_json::Value>(&descriptor, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Materialization { .. }));

    let failures = entries(&log).into_iter().filter(|e| e.starts_with("send_failed")).count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn missing_converter_is_unsupported_content() {
    let addr = spawn_server();
    let err = Engine::default()
        .execute::<Json<Greeting>>(&RequestDescriptor::get(&url(addr, "/text")), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::UnsupportedContent { .. }));
}

#[tokio::test]
async fn multipart_upload() {
    let addr = spawn_server();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"0123456789").unwrap();
    let file_name = file.path().file_name().unwrap().to_string_lossy().into_owned();

    let body = MultipartBody::new()
        .text("title", "hello", None)
        .file("doc", file.path(), "application/octet-stream")
        .bytes("blob", Bytes::from_static(&[1, 2, 3]), "image/png", Some("a.png"));
    let descriptor = RequestDescriptor::post(&url(addr, "/upload")).content(ContentDescriptor::multipart(body));

    let parts = Engine::default()
        .execute::<Json<Vec<UploadedPart>>>(&descriptor, &CancellationToken::new())
        .await
        .unwrap()
        .value
        .0;

    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0].name, "title");
    assert_eq!(parts[0].size, 5);
    assert_eq!(parts[1].name, "doc");
    assert_eq!(parts[1].file_name.as_deref(), Some(file_name.as_str()));
    assert_eq!(parts[1].size, 10);
    assert_eq!(parts[2].file_name.as_deref(), Some("a.png"));
    assert_eq!(parts[2].content_type.as_deref(), Some("image/png"));
}

#[tokio::test]
async fn file_body_is_streamed() {
    let addr = spawn_server();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"file contents").unwrap();

    let descriptor = RequestDescriptor::post(&url(addr, "/echo")).content(ContentDescriptor::new(
        ContentValue::File(file.path().to_path_buf()),
        "text/plain",
    ));
    let result = Engine::default()
        .execute::<String>(&descriptor, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.value, "file contents");
}

#[tokio::test]
async fn transport_failure_runs_the_failure_hook_once() {
    // Bind then drop, so the port is very likely closed.
    let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let log = log();
    let descriptor = recorded(RequestDescriptor::get(&url(addr, "/text")), &log);

    let err = Engine::default()
        .execute::<String>(&descriptor, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::Transport(_)));
    let log = entries(&log);
    assert_eq!(log.len(), 3);
    assert!(log[2].starts_with("send_failed: transport error"));
}

#[tokio::test]
async fn timeout_elapses() {
    let addr = spawn_server();
    let log = log();
    let descriptor =
        recorded(RequestDescriptor::get(&url(addr, "/delay/500")), &log).timeout(Duration::from_millis(50));

    let err = Engine::default()
        .execute::<String>(&descriptor, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Timeout(Duration::from_millis(50)));
    assert!(entries(&log).last().unwrap().starts_with("send_failed"));
}

#[tokio::test]
async fn cancellation_aborts_in_flight_call_without_callbacks() {
    let addr = spawn_server();
    let log = log();
    let descriptor = recorded(RequestDescriptor::get(&url(addr, "/delay/500")), &log);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let engine = Engine::default();
    let err = engine.execute::<String>(&descriptor, &cancel).await.unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(entries(&log), ["pre_set_content", "pre_send"]);

    let stats = engine.pool().stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].ref_count, 0);
}

#[test]
fn blocking_form_matches_async_form() {
    let addr = spawn_server();
    let engine = Engine::default();
    let result = engine
        .execute_blocking::<String>(&RequestDescriptor::get(&url(addr, "/text")), &CancellationToken::new())
        .unwrap();
    assert_eq!(result.value, "hello from courier");

    let err = engine
        .execute_blocking::<String>(
            &RequestDescriptor::get(&url(addr, "/status/500")).ensure_success(true),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, CallError::NonSuccessStatus { status: 500, .. }));
}

#[test]
fn blocking_form_reraises_cancellation() {
    let addr = spawn_server();
    let engine = Engine::default();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        trigger.cancel();
    });

    let err = engine
        .execute_blocking::<String>(&RequestDescriptor::get(&url(addr, "/delay/500")), &cancel)
        .unwrap_err();
    assert_eq!(err, CallError::Cancelled);
    assert_eq!(engine.pool().stats()[0].ref_count, 0);
}

#[tokio::test]
async fn pooled_clients_are_created_once_and_released() {
    let addr = spawn_server();
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let engine = Engine::builder()
        .factory("counting", move || -> Result<ProvidedClient, CallError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ProvidedClient::new(reqwest::Client::new()))
        })
        .build();
    let descriptor = RequestDescriptor::get(&url(addr, "/text")).factory("counting");

    for _ in 0..3 {
        engine.execute::<String>(&descriptor, &CancellationToken::new()).await.unwrap();
    }
    assert_eq!(created.load(Ordering::SeqCst), 1);
    let stats = engine.pool().stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].key, "named:counting");
    assert_eq!(stats[0].ref_count, 0);

    // Opting out of pooling evicts the cached client and uses a fresh one.
    engine
        .execute::<String>(&descriptor.clone().pooling(false), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert!(engine.pool().is_empty());
}

#[tokio::test]
async fn headers_only_response_keeps_client_leased() {
    let addr = spawn_server();
    let engine = Engine::default();
    let message = engine
        .send(&RequestDescriptor::get(&url(addr, "/text")), Completion::HeadersRead, &CancellationToken::new())
        .await
        .unwrap();

    assert!(message.is_streaming());
    assert_eq!(engine.pool().stats()[0].ref_count, 1);
    let body = message.bytes().await.unwrap();
    assert_eq!(&body[..], b"hello from courier");
    assert_eq!(engine.pool().stats()[0].ref_count, 0);
}
