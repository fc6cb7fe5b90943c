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

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::Stream;

pub use incus::IncusClient;
pub use types::*;

pub mod incus;
mod types;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to connect to {0}: {1}")]
    Connection(String, #[source] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("api error (code {code}): {message}")]
    Api { code: u16, message: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

/// A stream of platform events. Items that fail with [Error::Decode] describe a single bad event;
/// any other error means the stream is broken and should be re-established.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Error>> + Send>>;

/// InstanceServer is the view of the compute platform needed to discover upstreams.
#[async_trait::async_trait]
pub trait InstanceServer: Send + Sync + 'static {
    /// Lists instances across all projects, optionally filtered by type.
    async fn list_instances(&self, instance_type: InstanceType) -> Result<Vec<Instance>, Error>;

    /// Fetches an instance's configuration together with its live state.
    async fn get_instance_full(&self, project: &str, name: &str) -> Result<InstanceFull, Error>;

    /// Subscribes to lifecycle events across all projects.
    async fn subscribe_events(&self) -> Result<EventStream, Error>;
}

/// Bounds a platform call by `timeout`, labelling the error with `op`.
pub async fn with_timeout<T, F>(op: &'static str, timeout: Duration, f: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(timeout, f)
        .await
        .map_err(|_| Error::Timeout(op, timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported() {
        let res: Result<(), Error> = with_timeout("list instances", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_matches!(res, Err(Error::Timeout("list instances", _)));
    }

    #[tokio::test]
    async fn inner_error_passes_through() {
        let res: Result<(), Error> = with_timeout("list instances", Duration::from_secs(1), async {
            Err(Error::Api {
                code: 404,
                message: "not found".to_string(),
            })
        })
        .await;
        assert_matches!(res, Err(Error::Api { code: 404, .. }));
    }
}
