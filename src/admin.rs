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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use http::header::HOST;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use itertools::Itertools;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::Serialize;

use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::hyper_util::{self, Body, empty_response, json_response, plaintext_response};
use crate::readiness::Ready;
use crate::state::Candidate;
use crate::state::matcher::RequestHead;
use crate::upstreams::{UpstreamSource, Upstreams};
use crate::version::BuildInfo;
use crate::{signal, telemetry};

struct State {
    upstreams: Upstreams,
    ready: Ready,
    registry: Arc<Mutex<Registry>>,
    config: Config,
    shutdown_trigger: signal::ShutdownTrigger,
}

/// Service serves the admin endpoints: readiness, upstream dumps, metrics and runtime controls.
pub struct Service {
    s: hyper_util::Server<State>,
}

#[derive(Serialize)]
struct UpstreamsDump<'a> {
    candidates: &'a [Candidate],
}

#[derive(Serialize)]
struct ConfigDump<'a> {
    config: &'a Config,
    version: BuildInfo,
}

impl Service {
    pub async fn new(
        config: Config,
        upstreams: Upstreams,
        ready: Ready,
        registry: Arc<Mutex<Registry>>,
        shutdown_trigger: signal::ShutdownTrigger,
        drain_rx: DrainWatcher,
    ) -> anyhow::Result<Self> {
        let addr = config.admin_addr;
        let state = State {
            upstreams,
            ready,
            registry,
            config,
            shutdown_trigger: shutdown_trigger.clone(),
        };
        hyper_util::Server::bind("admin", addr, shutdown_trigger, drain_rx, state)
            .await
            .with_context(|| format!("failed to bind admin server on {addr}"))
            .map(|s| Service { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|state, req| async move {
            match req.uri().path() {
                "/healthz/ready" => handle_ready(&state.ready, &req),
                "/upstreams" => handle_upstreams(&state.upstreams, &req),
                "/upstreams/match" => handle_match(&state.upstreams, &req),
                "/metrics" | "/stats/prometheus" => handle_metrics(&state.registry, &req),
                "/config_dump" => handle_config_dump(&state.config, &req),
                "/quitquitquit" => {
                    handle_server_shutdown(&state.shutdown_trigger, req.method()).await
                }
                "/logging" => handle_logging(&req),
                _ => empty_response(StatusCode::NOT_FOUND),
            }
        })
    }
}

fn handle_ready(ready: &Ready, req: &Request<Incoming>) -> Response<Body> {
    if req.method() != Method::GET {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    let pending = ready.pending();
    if pending.is_empty() {
        plaintext_response(StatusCode::OK, "ready\n".to_string())
    } else {
        plaintext_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("not ready, pending: {}\n", pending.iter().sorted().join(", ")),
        )
    }
}

fn handle_upstreams(upstreams: &Upstreams, req: &Request<Incoming>) -> Response<Body> {
    if req.method() != Method::GET {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    let snapshot = upstreams.store().snapshot();
    json_response(
        StatusCode::OK,
        &UpstreamsDump {
            candidates: &snapshot,
        },
    )
}

/// Runs request matching against this request, or against `?host=` when given.
fn handle_match(upstreams: &Upstreams, req: &Request<Incoming>) -> Response<Body> {
    if req.method() != Method::GET {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    let matched = match query_params(req).get("host") {
        Some(host) => {
            let by_host = match Request::builder()
                .uri(req.uri().clone())
                .header(HOST, host.as_str())
                .body(())
            {
                Ok(by_host) => by_host,
                Err(err) => {
                    return plaintext_response(
                        StatusCode::BAD_REQUEST,
                        format!("invalid host {host:?}: {err}\n"),
                    );
                }
            };
            upstreams.get_upstreams(RequestHead::from(&by_host))
        }
        None => upstreams.get_upstreams(RequestHead::from(req)),
    };
    json_response(StatusCode::OK, &matched)
}

fn handle_metrics<B>(registry: &Mutex<Registry>, req: &Request<B>) -> Response<Body> {
    if req.method() != Method::GET {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    let mut buf = String::new();
    let registry = registry.lock().expect("mutex");
    if let Err(err) = encode(&mut buf, &registry) {
        return plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type(req))
        .body(buf.into())
        .expect("builder with known status code should not fail")
}

fn handle_config_dump(config: &Config, req: &Request<Incoming>) -> Response<Body> {
    if req.method() != Method::GET {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    json_response(
        StatusCode::OK,
        &ConfigDump {
            config,
            version: BuildInfo::new(),
        },
    )
}

async fn handle_server_shutdown(
    shutdown_trigger: &signal::ShutdownTrigger,
    method: &Method,
) -> Response<Body> {
    match *method {
        Method::POST => {
            shutdown_trigger.shutdown_now().await;
            plaintext_response(StatusCode::OK, "shutdown now\n".into())
        }
        _ => empty_response(StatusCode::METHOD_NOT_ALLOWED),
    }
}

//mirror envoy's behavior: https://www.envoyproxy.io/docs/envoy/latest/operations/admin#post--logging
static HELP_STRING: &str = "
usage: POST /logging\t\t\t\t\t\t(To list current level)
usage: POST /logging?level=<level>\t\t\t\t(To change global levels)
usage: POST /logging?level={mod1}:{level1},{mod2}:{level2}\t(To change specific mods' logging level)
usage: POST /logging?reset\t\t\t\t\t(To reset to the startup level)

hint: loglevel:\terror|warn|info|debug|trace|off
hint: mod_name:\tthe module name, i.e. incus_upstreams::watcher
";

fn handle_logging(req: &Request<Incoming>) -> Response<Body> {
    match *req.method() {
        Method::POST => {
            let qp = query_params(req);
            let level = qp.get("level").cloned();
            let reset = qp.get("reset").cloned();
            if level.is_some() || reset.is_some() {
                change_log_level(reset.is_some(), &level.unwrap_or_default())
            } else {
                list_loggers()
            }
        }
        _ => plaintext_response(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Invalid HTTP method\n {HELP_STRING}"),
        ),
    }
}

fn list_loggers() -> Response<Body> {
    match telemetry::get_current_loglevel() {
        Ok(loglevel) => plaintext_response(
            StatusCode::OK,
            format!("current log level is {loglevel}\n"),
        ),
        Err(err) => plaintext_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to get the log level: {err}\n {HELP_STRING}"),
        ),
    }
}

fn change_log_level(reset: bool, level: &str) -> Response<Body> {
    match telemetry::set_level(reset, level) {
        Ok(_) => list_loggers(),
        Err(e) => plaintext_response(
            StatusCode::BAD_REQUEST,
            format!("failed to set new level: {e}\n{HELP_STRING}"),
        ),
    }
}

fn query_params<B>(req: &Request<B>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|v| {
            url::form_urlencoded::parse(v.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Default)]
enum ContentType {
    #[default]
    PlainText,
    OpenMetrics,
}

impl From<ContentType> for &str {
    fn from(c: ContentType) -> Self {
        match c {
            ContentType::PlainText => "text/plain; charset=utf-8",
            ContentType::OpenMetrics => "application/openmetrics-text;charset=utf-8;version=1.0.0",
        }
    }
}

fn content_type<T>(req: &Request<T>) -> &'static str {
    req.headers()
        .get_all(http::header::ACCEPT)
        .iter()
        .find_map(|v| {
            let v = v.to_str().unwrap_or_default().to_lowercase();
            match v.split(';').next().map(str::trim) {
                Some("application/openmetrics-text") => Some(ContentType::OpenMetrics),
                _ => None,
            }
        })
        .unwrap_or_default()
        .into()
}
