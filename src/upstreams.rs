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

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::metrics::Metrics;
use crate::platform::{self, InstanceServer};
use crate::reconcile::Reconciler;
use crate::state::CandidateStore;
use crate::state::matcher::RequestHead;
use crate::strng::Strng;
use crate::watcher::EventWatcher;

/// A dial target handed to the proxy engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Upstream {
    pub dial: Strng,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dial)
    }
}

/// UpstreamSource is consumed by the proxy engine on the request path.
///
/// Implementations must not block on I/O and must be safe to call concurrently.
/// A [RequestHead] can be taken from either a full `Request` or its `Parts`.
pub trait UpstreamSource: Send + Sync {
    fn get_upstreams(&self, req: RequestHead<'_>) -> Vec<Upstream>;
}

/// Upstreams discovers dial targets from Incus instances.
#[derive(Debug, Clone, Default)]
pub struct Upstreams {
    store: Arc<CandidateStore>,
}

impl Upstreams {
    pub fn new(store: Arc<CandidateStore>) -> Self {
        Upstreams { store }
    }

    pub fn store(&self) -> &Arc<CandidateStore> {
        &self.store
    }

    /// Performs the initial reconciliation and starts the event watcher.
    ///
    /// Failing to list the inventory here is fatal; once running, all platform errors are
    /// retried in the background until `drain` is signaled.
    pub async fn provision(
        &self,
        platform: Arc<dyn InstanceServer>,
        config: &Config,
        metrics: Arc<Metrics>,
        drain: DrainWatcher,
    ) -> Result<JoinHandle<()>, platform::Error> {
        let reconciler = Reconciler::new(
            platform.clone(),
            self.store.clone(),
            config.instance_type,
            config.platform_timeout,
            metrics.clone(),
        );
        let candidates = reconciler.reconcile().await?;
        info!(candidates, "initial reconciliation complete");

        let watcher = EventWatcher::new(
            platform,
            reconciler,
            config.reconnect_backoff,
            config.platform_timeout,
            metrics,
        );
        Ok(tokio::spawn(watcher.run(drain)))
    }
}

impl UpstreamSource for Upstreams {
    fn get_upstreams(&self, req: RequestHead<'_>) -> Vec<Upstream> {
        self.store
            .matching(req)
            .into_iter()
            .map(|dial| Upstream { dial })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::Request;
    use http::header::HOST;
    use matches::assert_matches;

    use super::*;
    use crate::drain;
    use crate::platform::INSTANCE_STARTED;
    use crate::test_helpers::{self, MockServer, lifecycle_event, web_instance};

    fn request(host: &str) -> Request<()> {
        Request::builder().header(HOST, host).body(()).unwrap()
    }

    fn lookup(source: &dyn UpstreamSource, host: &str) -> Vec<Upstream> {
        source.get_upstreams(RequestHead::from(&request(host)))
    }

    #[tokio::test]
    async fn provision_populates_and_watches() {
        let server = Arc::new(MockServer::with_instances(vec![web_instance(
            "web1",
            "example.com",
            "8080",
            "192.168.1.10",
        )]));
        let upstreams = Upstreams::default();
        let (trigger, drain) = drain::new();
        let task = upstreams
            .provision(
                server.clone(),
                &test_helpers::test_config(),
                Arc::new(Metrics::default()),
                drain,
            )
            .await
            .unwrap();

        assert_eq!(
            lookup(&upstreams, "example.com"),
            vec![Upstream {
                dial: "192.168.1.10:8080".into()
            }]
        );
        assert!(lookup(&upstreams, "other.com").is_empty());

        server.wait_for_subscriptions(1).await;
        server.add_instance(web_instance("web2", "example.com", "9090", "192.168.1.11"));
        assert!(server.send_event(lifecycle_event(INSTANCE_STARTED, "web2")));
        for _ in 0..100 {
            if upstreams.store().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let dials: Vec<String> = lookup(&upstreams, "EXAMPLE.com:443")
            .iter()
            .map(Upstream::to_string)
            .collect();
        assert_eq!(dials, vec!["192.168.1.10:8080", "192.168.1.11:9090"]);

        trigger.start_drain_and_wait().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn provision_fails_without_inventory() {
        let server = Arc::new(MockServer::new());
        server.fail_list(true);
        let (_trigger, drain) = drain::new();
        let res = Upstreams::default()
            .provision(
                server.clone(),
                &test_helpers::test_config(),
                Arc::new(Metrics::default()),
                drain,
            )
            .await;
        assert_matches!(res, Err(platform::Error::Api { code: 500, .. }));
        assert_eq!(server.subscribe_attempts(), 0);
    }

    #[test]
    fn usable_as_trait_object() {
        let upstreams = Upstreams::default();
        let source: Arc<dyn UpstreamSource> = Arc::new(upstreams.clone());
        assert!(lookup(source.as_ref(), "example.com").is_empty());
        let (parts, ()) = request("example.com").into_parts();
        assert!(source.get_upstreams(RequestHead::from(&parts)).is_empty());
    }
}
