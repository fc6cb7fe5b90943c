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

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::StreamExt;
use futures::future;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};
use url::Url;

use super::types::ResponseEnvelope;
use super::{Error, Event, EventStream, Instance, InstanceFull, InstanceServer, InstanceType};

// The daemon ignores the host, but HTTP/1.1 requires one.
const API_HOST: &str = "incus";

/// IncusClient talks to the local Incus daemon over its unix socket.
/// Every call dials a fresh connection, so the client holds no connection state and is cheap to share.
#[derive(Debug, Clone)]
pub struct IncusClient {
    socket: PathBuf,
}

impl IncusClient {
    /// Creates a client without contacting the daemon.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        IncusClient {
            socket: socket.into(),
        }
    }

    /// Creates a client and verifies the daemon answers on `socket`.
    pub async fn connect(socket: impl Into<PathBuf>) -> Result<Self, Error> {
        let client = Self::new(socket);
        let server: serde_json::Value = client.get("/1.0").await?;
        debug!(
            socket=%client.socket.display(),
            api_version=?server.get("api_version"),
            "connected to incus"
        );
        Ok(client)
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn dial(&self) -> Result<UnixStream, Error> {
        UnixStream::connect(&self.socket)
            .await
            .map_err(|e| Error::Connection(self.socket.display().to_string(), e))
    }

    async fn get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, Error> {
        let stream = self.dial().await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("incus connection closed with error: {err}");
            }
        });

        let req = Request::get(path_and_query)
            .header(hyper::header::HOST, API_HOST)
            .body(Empty::<Bytes>::new())?;
        trace!(path = path_and_query, "sending request");
        let res = sender.send_request(req).await?;
        let status = res.status();
        let body = res.into_body().collect().await?.to_bytes();

        let envelope: ResponseEnvelope = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(Error::Api {
                    code: status.as_u16(),
                    message: String::from_utf8_lossy(&body).trim().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if envelope.response_type == "error" {
            return Err(Error::Api {
                code: if envelope.error_code != 0 {
                    envelope.error_code
                } else {
                    envelope.status_code
                },
                message: envelope.error,
            });
        }
        Ok(serde_json::from_value(envelope.metadata)?)
    }
}

fn api_url(segments: &[&str]) -> Url {
    let mut url = Url::parse("http://incus/1.0").expect("static base url is valid");
    url.path_segments_mut()
        .expect("http urls have a path")
        .extend(segments);
    url
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

fn instances_path(instance_type: InstanceType) -> String {
    let mut url = api_url(&["instances"]);
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("recursion", "1")
            .append_pair("all-projects", "true");
        if let Some(t) = instance_type.as_filter() {
            query.append_pair("instance-type", t);
        }
    }
    path_and_query(&url)
}

fn instance_full_path(project: &str, name: &str) -> String {
    let mut url = api_url(&["instances", name]);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("recursion", "1");
        if !project.is_empty() {
            query.append_pair("project", project);
        }
    }
    path_and_query(&url)
}

fn events_url() -> String {
    format!("ws://{API_HOST}/1.0/events?type=lifecycle&all-projects=true")
}

fn decode_message(msg: Result<Message, tungstenite::Error>) -> Option<Result<Event, Error>> {
    match msg {
        Ok(Message::Text(text)) => Some(serde_json::from_str(text.as_str()).map_err(Error::from)),
        Ok(Message::Binary(data)) => Some(serde_json::from_slice(&data).map_err(Error::from)),
        // Control frames are answered by tungstenite itself.
        Ok(_) => None,
        Err(e) => Some(Err(Error::WebSocket(Box::new(e)))),
    }
}

#[async_trait::async_trait]
impl InstanceServer for IncusClient {
    async fn list_instances(&self, instance_type: InstanceType) -> Result<Vec<Instance>, Error> {
        self.get(&instances_path(instance_type)).await
    }

    async fn get_instance_full(&self, project: &str, name: &str) -> Result<InstanceFull, Error> {
        self.get(&instance_full_path(project, name)).await
    }

    async fn subscribe_events(&self) -> Result<EventStream, Error> {
        let stream = self.dial().await?;
        let (ws, _) = tokio_tungstenite::client_async(events_url(), stream)
            .await
            .map_err(Box::new)?;
        debug!("subscribed to incus events");
        Ok(Box::pin(
            ws.filter_map(|msg| future::ready(decode_message(msg))),
        ))
    }
}
