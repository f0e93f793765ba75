#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Tests for the Consul HTTP transport against a mock agent.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_bytes, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pipemesh_kv::{ConsulKv, KvError, KvStore};

async fn agent() -> (MockServer, ConsulKv) {
    let server = MockServer::start().await;
    let kv = ConsulKv::new(&server.uri()).unwrap();
    (server, kv)
}

#[tokio::test]
async fn get_absent_key_is_none() {
    let (server, kv) = agent().await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/pipes/t-p1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(kv.get("pipes/t-p1").await.unwrap().is_none());
}

#[tokio::test]
async fn get_decodes_base64_value() {
    let (server, kv) = agent().await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/pipes/t-p1"))
        .and(query_param("consistent", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "Key": "pipes/t-p1",
            "Value": "eyJhIjoxfQ==",
            "ModifyIndex": 17,
            "CreateIndex": 12,
            "Flags": 0,
            "LockIndex": 0
        }])))
        .mount(&server)
        .await;

    let pair = kv.get("pipes/t-p1").await.unwrap().unwrap();
    assert_eq!(pair.key, "pipes/t-p1");
    assert_eq!(pair.value, br#"{"a":1}"#);
    assert_eq!(pair.modify_index, 17);
}

#[tokio::test]
async fn get_server_error_is_status_error() {
    let (server, kv) = agent().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = kv.get("k").await.unwrap_err();
    assert!(matches!(err, KvError::Status { status: 500, .. }));
}

#[tokio::test]
async fn cas_sends_index_and_body() {
    let (server, kv) = agent().await;
    Mock::given(method("PUT"))
        .and(path("/v1/kv/pipes/t-p1"))
        .and(query_param("cas", "17"))
        .and(body_bytes(b"{\"a\":2}".to_vec()))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(1)
        .mount(&server)
        .await;

    assert!(kv.cas("pipes/t-p1", b"{\"a\":2}".to_vec(), 17).await.unwrap());
}

#[tokio::test]
async fn cas_lost_race_is_false() {
    let (server, kv) = agent().await;
    Mock::given(method("PUT"))
        .and(query_param("cas", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_string("false\n"))
        .mount(&server)
        .await;

    assert!(!kv.cas("k", b"{}".to_vec(), 0).await.unwrap());
}

#[tokio::test]
async fn blocking_list_reads_index_header() {
    let (server, kv) = agent().await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/pipes/"))
        .and(query_param("recurse", ""))
        .and(query_param("index", "40"))
        .and(query_param("wait", "10s"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "42")
                .set_body_json(json!([
                    {"Key": "pipes/a", "Value": "e30=", "ModifyIndex": 41},
                    {"Key": "pipes/b", "Value": null, "ModifyIndex": 42}
                ])),
        )
        .mount(&server)
        .await;

    let list = kv
        .list("pipes/", 40, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(list.index, 42);
    assert_eq!(list.pairs.len(), 2);
    assert_eq!(list.pairs[0].value, b"{}");
    assert!(list.pairs[1].value.is_empty());
}

#[tokio::test]
async fn empty_prefix_list_is_empty_with_index() {
    let (server, kv) = agent().await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/pipes/"))
        .respond_with(ResponseTemplate::new(404).insert_header("X-Consul-Index", "9"))
        .mount(&server)
        .await;

    let list = kv.list("pipes/", 0, None).await.unwrap();
    assert!(list.pairs.is_empty());
    assert_eq!(list.index, 9);
}

#[tokio::test]
async fn delete_issues_delete() {
    let (server, kv) = agent().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/kv/pipes/t-p1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(1)
        .mount(&server)
        .await;

    kv.delete("pipes/t-p1").await.unwrap();
}
