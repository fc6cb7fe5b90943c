// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::HOST;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use incus_upstreams::app;
use incus_upstreams::platform::INSTANCE_STARTED;
use incus_upstreams::test_helpers::helpers::initialize_telemetry;
use incus_upstreams::test_helpers::{MockServer, lifecycle_event, test_config, web_instance};
use serde_json::{Value, json};
use tokio::net::TcpStream;

async fn request(addr: SocketAddr, method: Method, path: &str, host: &str) -> (StatusCode, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let req = Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn get(addr: SocketAddr, path: &str) -> (StatusCode, String) {
    request(addr, Method::GET, path, "localhost").await
}

async fn matched(addr: SocketAddr, host: &str) -> Value {
    let (status, body) = request(addr, Method::GET, "/upstreams/match", host).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_str(&body).unwrap()
}

#[tokio::test]
async fn serves_discovered_upstreams() {
    initialize_telemetry();
    let server = Arc::new(MockServer::with_instances(vec![web_instance(
        "web1",
        "example.com",
        "8080",
        "192.168.1.10",
    )]));
    let bound = app::build_with_platform(test_config(), server.clone())
        .await
        .unwrap();
    let addr = bound.admin_address;
    let shutdown = bound.shutdown.trigger();
    let app = tokio::spawn(bound.wait_termination());

    let (status, _) = get(addr, "/healthz/ready").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        matched(addr, "example.com").await,
        json!([{"dial": "192.168.1.10:8080"}])
    );
    assert_eq!(matched(addr, "other.com").await, json!([]));

    let (status, body) = get(addr, "/upstreams/match?host=example.com").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap(),
        json!([{"dial": "192.168.1.10:8080"}])
    );

    let (status, body) = get(addr, "/upstreams").await;
    assert_eq!(status, StatusCode::OK);
    let dump: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(dump["candidates"][0]["dial"], json!("192.168.1.10:8080"));
    assert_eq!(
        dump["candidates"][0]["matchers"],
        json!([{"host": ["example.com"]}])
    );

    // A started instance shows up once its lifecycle event arrives.
    server.wait_for_subscriptions(1).await;
    server.add_instance(web_instance("web2", "example.com", "9090", "192.168.1.11"));
    assert!(server.send_event(lifecycle_event(INSTANCE_STARTED, "web2")));
    let expected = json!([{"dial": "192.168.1.10:8080"}, {"dial": "192.168.1.11:9090"}]);
    let mut current = Value::Null;
    for _ in 0..100 {
        current = matched(addr, "example.com").await;
        if current == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(current, expected);

    let (status, body) = get(addr, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("incus_upstreams_candidates 2"), "{body}");
    assert!(body.contains("incus_upstreams_reconciliations_total{outcome=\"Success\"} 2"), "{body}");

    shutdown.shutdown_now().await;
    tokio::time::timeout(Duration::from_secs(5), app)
        .await
        .expect("app terminates")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn admin_shutdown_terminates_app() {
    initialize_telemetry();
    let server = Arc::new(MockServer::new());
    let bound = app::build_with_platform(test_config(), server).await.unwrap();
    let addr = bound.admin_address;
    let app = tokio::spawn(bound.wait_termination());

    let (status, _) = get(addr, "/quitquitquit").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, body) = request(addr, Method::POST, "/quitquitquit", "localhost").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "shutdown now\n");

    tokio::time::timeout(Duration::from_secs(5), app)
        .await
        .expect("app terminates")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn build_fails_without_inventory() {
    initialize_telemetry();
    let server = Arc::new(MockServer::new());
    server.fail_list(true);
    let err = match app::build_with_platform(test_config(), server.clone()).await {
        Ok(_) => panic!("build should fail"),
        Err(err) => err,
    };
    assert!(
        format!("{err:#}").contains("initial reconciliation failed"),
        "{err:#}"
    );
    assert_eq!(server.subscribe_attempts(), 0);
}

#[tokio::test]
async fn build_fails_without_daemon() {
    initialize_telemetry();
    let mut config = test_config();
    config.incus_socket = std::env::temp_dir().join("incus-upstreams-missing.socket");
    let err = match app::build(config).await {
        Ok(_) => panic!("build should fail"),
        Err(err) => err,
    };
    assert!(
        format!("{err:#}").contains("failed to connect to incus"),
        "{err:#}"
    );
}
