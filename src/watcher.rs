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

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::drain::DrainWatcher;
use crate::metrics::{ConnectionTerminationReason, EventDisposition, IncrementRecorder, Metrics};
use crate::platform::{
    self, EVENT_TYPE_LIFECYCLE, INSTANCE_RESTARTED, INSTANCE_STARTED, InstanceServer,
    with_timeout,
};
use crate::reconcile::Reconciler;

/// Lifecycle actions that trigger a reconciliation.
pub const MONITORED_ACTIONS: &[&str] = &[INSTANCE_STARTED, INSTANCE_RESTARTED];

#[derive(thiserror::Error, Debug)]
enum WatchError {
    #[error("unable to monitor instance events: {0}")]
    Subscribe(#[source] platform::Error),
    #[error("event stream failed: {0}")]
    Stream(#[source] platform::Error),
}

/// EventWatcher follows the platform's lifecycle events and reconciles whenever an instance
/// starts or restarts. Subscriptions are retried forever with a fixed backoff until drained.
pub struct EventWatcher {
    platform: Arc<dyn InstanceServer>,
    reconciler: Reconciler,
    backoff: Duration,
    timeout: Duration,
    metrics: Arc<Metrics>,
    connection_id: u32,
}

impl EventWatcher {
    pub fn new(
        platform: Arc<dyn InstanceServer>,
        reconciler: Reconciler,
        backoff: Duration,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        EventWatcher {
            platform,
            reconciler,
            backoff,
            timeout,
            metrics,
            connection_id: 0,
        }
    }

    /// Runs until `drain` is signaled.
    pub async fn run(mut self, drain: DrainWatcher) {
        let drained = drain.wait_for_drain();
        tokio::pin!(drained);
        loop {
            self.connection_id += 1;
            let id = self.connection_id;
            tokio::select! {
                blocker = &mut drained => {
                    info!("event watcher drained");
                    drop(blocker);
                    return;
                }
                _ = self.run_loop().instrument(info_span!("watch", id)) => {}
            }
        }
    }

    async fn run_loop(&mut self) {
        match self.watch().await {
            Err(e @ WatchError::Subscribe(_)) => {
                warn!("{e}, retrying in {:?}", self.backoff);
                self.metrics
                    .increment(&ConnectionTerminationReason::SubscribeError);
            }
            Err(e @ WatchError::Stream(_)) => {
                warn!("{e}, retrying in {:?}", self.backoff);
                self.metrics
                    .increment(&ConnectionTerminationReason::StreamError);
            }
            Ok(()) => {
                info!("event stream ended, reconnecting in {:?}", self.backoff);
                self.metrics
                    .increment(&ConnectionTerminationReason::Complete);
            }
        }
        tokio::time::sleep(self.backoff).await;
    }

    async fn watch(&mut self) -> Result<(), WatchError> {
        let mut events = with_timeout(
            "subscribe to events",
            self.timeout,
            self.platform.subscribe_events(),
        )
        .await
        .map_err(WatchError::Subscribe)?;
        debug!("initialised event listener");

        if self.connection_id > 1 {
            // Events may have been missed while we were disconnected.
            self.reconcile("resubscribed").await;
        }

        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(platform::Error::Decode(err)) => {
                    debug!("unable to decode event: {err}");
                    self.metrics.increment(&EventDisposition::Undecodable);
                    continue;
                }
                Err(err) => return Err(WatchError::Stream(err)),
            };
            if event.event_type != EVENT_TYPE_LIFECYCLE {
                trace!(event_type=%event.event_type, "ignoring event");
                self.metrics.increment(&EventDisposition::Ignored);
                continue;
            }
            let lifecycle = match event.lifecycle() {
                Ok(lifecycle) => lifecycle,
                Err(err) => {
                    debug!(?event, "unable to decode event metadata: {err}");
                    self.metrics.increment(&EventDisposition::Undecodable);
                    continue;
                }
            };
            if !MONITORED_ACTIONS.contains(&lifecycle.action.as_str()) {
                trace!(action=%lifecycle.action, "ignoring event");
                self.metrics.increment(&EventDisposition::Ignored);
                continue;
            }

            debug!(
                action=%lifecycle.action,
                instance=%lifecycle.name,
                project=%event.project,
                "handling event"
            );
            self.metrics.increment(&EventDisposition::Reconciled);
            self.reconcile(&lifecycle.action).await;
        }
        Ok(())
    }

    async fn reconcile(&self, cause: &str) {
        if let Err(err) = self.reconciler.reconcile().await {
            error!(%cause, "unable to reconcile upstreams: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    use super::*;
    use crate::drain::{self, DrainTrigger};
    use crate::platform::{Event, InstanceType};
    use crate::state::CandidateStore;
    use crate::test_helpers::{MockServer, lifecycle_event, web_instance};

    const BACKOFF: Duration = Duration::from_millis(500);

    struct Harness {
        server: Arc<MockServer>,
        store: Arc<CandidateStore>,
        trigger: DrainTrigger,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(server: MockServer) -> Self {
            let server = Arc::new(server);
            let store = Arc::new(CandidateStore::default());
            let metrics = Arc::new(Metrics::default());
            let reconciler = Reconciler::new(
                server.clone(),
                store.clone(),
                InstanceType::Container,
                Duration::from_secs(1),
                metrics.clone(),
            );
            let watcher = EventWatcher::new(
                server.clone(),
                reconciler,
                BACKOFF,
                Duration::from_secs(1),
                metrics,
            );
            let (trigger, drain) = drain::new();
            let task = tokio::spawn(watcher.run(drain));
            Harness {
                server,
                store,
                trigger,
                task,
            }
        }

        async fn stop(self) {
            tokio::time::timeout(Duration::from_secs(5), self.trigger.start_drain_and_wait())
                .await
                .expect("watcher drained");
            self.task.await.unwrap();
        }
    }

    async fn eventually(f: impl Fn() -> bool) {
        for _ in 0..100 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met");
    }

    #[tokio::test(start_paused = true)]
    async fn started_event_triggers_reconcile() {
        let h = Harness::start(MockServer::new());
        h.server.wait_for_subscriptions(1).await;

        h.server
            .add_instance(web_instance("web1", "example.com", "8080", "192.168.1.10"));
        assert!(h.server.send_event(lifecycle_event(INSTANCE_STARTED, "web1")));
        eventually(|| h.store.len() == 1).await;
        assert_eq!(h.server.list_calls(), 1);

        h.server
            .add_instance(web_instance("web2", "example.org", "8080", "192.168.1.11"));
        assert!(h.server.send_event(lifecycle_event(INSTANCE_RESTARTED, "web2")));
        eventually(|| h.store.len() == 2).await;
        assert_eq!(h.server.list_calls(), 2);

        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unmonitored_and_undecodable_events_are_ignored() {
        let h = Harness::start(MockServer::new());
        h.server.wait_for_subscriptions(1).await;
        h.server
            .add_instance(web_instance("web1", "example.com", "8080", "192.168.1.10"));

        assert!(h.server.send_event(lifecycle_event("instance-stopped", "web1")));
        assert!(h.server.send_undecodable());
        let mut garbage = lifecycle_event(INSTANCE_STARTED, "web1");
        garbage.metadata = serde_json::json!("not an object");
        assert!(h.server.send_event(garbage));
        let mut positional = lifecycle_event(INSTANCE_STARTED, "web1");
        positional.metadata =
            serde_json::json!([INSTANCE_STARTED, "/1.0/instances/web1", "web1"]);
        assert!(h.server.send_event(positional));
        let mut operation = lifecycle_event(INSTANCE_STARTED, "web1");
        operation.event_type = "operation".to_string();
        assert!(h.server.send_event(operation));
        // Processed in order, so once this lands the earlier events were all skipped.
        assert!(h.server.send_event(lifecycle_event(INSTANCE_STARTED, "web1")));

        eventually(|| h.store.len() == 1).await;
        assert_eq!(h.server.list_calls(), 1);
        assert_eq!(h.server.subscriptions(), 1);

        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_failures_are_retried_with_backoff() {
        let server = MockServer::with_instances(vec![web_instance(
            "web1",
            "example.com",
            "8080",
            "192.168.1.10",
        )]);
        server.fail_subscriptions(2);
        let start = Instant::now();
        let h = Harness::start(server);

        h.server.wait_for_subscriptions(1).await;
        assert_eq!(h.server.subscribe_attempts(), 3);
        assert!(start.elapsed() >= BACKOFF * 2);
        // Events could have been missed while disconnected, so the watcher catches up.
        eventually(|| h.store.len() == 1).await;
        assert_eq!(h.server.list_calls(), 1);

        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_resubscribes() {
        let h = Harness::start(MockServer::new());
        h.server.wait_for_subscriptions(1).await;

        h.server.close_stream();
        h.server.wait_for_subscriptions(2).await;
        eventually(|| h.server.list_calls() == 1).await;

        assert!(h.server.send_stream_error());
        h.server.wait_for_subscriptions(3).await;
        eventually(|| h.server.list_calls() == 2).await;

        // The new subscription delivers events as before.
        h.server
            .add_instance(web_instance("web1", "example.com", "8080", "192.168.1.10"));
        assert!(h.server.send_event(lifecycle_event(INSTANCE_STARTED, "web1")));
        eventually(|| h.store.len() == 1).await;

        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_errors_do_not_stop_the_watcher() {
        let h = Harness::start(MockServer::new());
        h.server.wait_for_subscriptions(1).await;

        h.server.fail_list(true);
        assert!(h.server.send_event(lifecycle_event(INSTANCE_STARTED, "web1")));
        eventually(|| h.server.list_calls() == 1).await;

        h.server.fail_list(false);
        h.server
            .add_instance(web_instance("web1", "example.com", "8080", "192.168.1.10"));
        assert!(h.server.send_event(lifecycle_event(INSTANCE_STARTED, "web1")));
        eventually(|| h.store.len() == 1).await;
        assert_eq!(h.server.subscriptions(), 1);

        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn drain_interrupts_backoff() {
        let server = MockServer::new();
        server.fail_subscriptions(usize::MAX);
        let h = Harness::start(server);
        eventually(|| h.server.subscribe_attempts() >= 2).await;
        assert_eq!(h.server.subscriptions(), 0);

        h.stop().await;
    }

    #[test]
    fn monitored_actions() {
        let event: Event = lifecycle_event(INSTANCE_STARTED, "web1");
        let action = event.lifecycle().unwrap().action;
        assert!(MONITORED_ACTIONS.contains(&action.as_str()));
        assert!(!MONITORED_ACTIONS.contains(&"instance-stopped"));
    }
}
