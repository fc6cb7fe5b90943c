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

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::platform::{Error, Event, EventStream, Instance, InstanceFull, InstanceServer, InstanceType};

/// MockServer is an in-memory [InstanceServer]. Tests control the inventory, inject failures,
/// and drive the event stream.
pub struct MockServer {
    state: Mutex<MockState>,
    subscriptions: watch::Sender<usize>,
}

#[derive(Default)]
struct MockState {
    instances: Vec<InstanceFull>,
    fail_list: bool,
    fail_full_state: HashSet<String>,
    subscribe_failures: usize,
    events: Option<mpsc::UnboundedSender<Result<Event, Error>>>,
    list_calls: usize,
    full_state_calls: Vec<(String, String)>,
    subscribe_attempts: usize,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    pub fn new() -> Self {
        let (subscriptions, _) = watch::channel(0);
        MockServer {
            state: Mutex::new(MockState::default()),
            subscriptions,
        }
    }

    pub fn with_instances(instances: Vec<InstanceFull>) -> Self {
        let server = Self::new();
        server.set_instances(instances);
        server
    }

    pub fn set_instances(&self, instances: Vec<InstanceFull>) {
        self.state.lock().unwrap().instances = instances;
    }

    pub fn add_instance(&self, instance: InstanceFull) {
        self.state.lock().unwrap().instances.push(instance);
    }

    /// Makes every inventory listing fail while `fail` is set.
    pub fn fail_list(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }

    /// Makes full state fetches for `name` fail.
    pub fn fail_full_state(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_full_state
            .insert(name.to_string());
    }

    /// Rejects the next `count` subscription attempts.
    pub fn fail_subscriptions(&self, count: usize) {
        self.state.lock().unwrap().subscribe_failures = count;
    }

    /// Delivers an event on the active subscription. Returns false if there is none.
    pub fn send_event(&self, event: Event) -> bool {
        self.send(Ok(event))
    }

    /// Breaks the active subscription with a transport error.
    pub fn send_stream_error(&self) -> bool {
        self.send(Err(Error::Api {
            code: 500,
            message: "stream reset".to_string(),
        }))
    }

    /// Delivers an event whose payload could not be decoded.
    pub fn send_undecodable(&self) -> bool {
        let err = serde_json::from_str::<Event>("not json").expect_err("input is invalid json");
        self.send(Err(Error::Decode(err)))
    }

    /// Ends the active subscription cleanly.
    pub fn close_stream(&self) {
        self.state.lock().unwrap().events = None;
    }

    fn send(&self, item: Result<Event, Error>) -> bool {
        match &self.state.lock().unwrap().events {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Waits until at least `count` subscriptions have been established.
    pub async fn wait_for_subscriptions(&self, count: usize) {
        let mut rx = self.subscriptions.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    pub fn subscriptions(&self) -> usize {
        *self.subscriptions.borrow()
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.state.lock().unwrap().subscribe_attempts
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    /// The `(project, name)` of every full state fetch, in call order.
    pub fn full_state_calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().full_state_calls.clone()
    }
}

#[async_trait::async_trait]
impl InstanceServer for MockServer {
    async fn list_instances(&self, instance_type: InstanceType) -> Result<Vec<Instance>, Error> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        if state.fail_list {
            return Err(Error::Api {
                code: 500,
                message: "inventory unavailable".to_string(),
            });
        }
        Ok(state
            .instances
            .iter()
            .filter(|i| match instance_type.as_filter() {
                Some(t) => i.instance.instance_type == t,
                None => true,
            })
            .map(|i| i.instance.clone())
            .collect())
    }

    async fn get_instance_full(&self, project: &str, name: &str) -> Result<InstanceFull, Error> {
        let mut state = self.state.lock().unwrap();
        state
            .full_state_calls
            .push((project.to_string(), name.to_string()));
        if state.fail_full_state.contains(name) {
            return Err(Error::Api {
                code: 500,
                message: format!("failed to load state of {name}"),
            });
        }
        state
            .instances
            .iter()
            .find(|i| i.instance.project == project && i.instance.name == name)
            .cloned()
            .ok_or_else(|| Error::Api {
                code: 404,
                message: "Instance not found".to_string(),
            })
    }

    async fn subscribe_events(&self) -> Result<EventStream, Error> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            state.subscribe_attempts += 1;
            if state.subscribe_failures > 0 {
                state.subscribe_failures -= 1;
                return Err(Error::Api {
                    code: 503,
                    message: "events unavailable".to_string(),
                });
            }
            let (tx, rx) = mpsc::unbounded_channel();
            // Replacing the sender ends any previous subscription.
            state.events = Some(tx);
            rx
        };
        self.subscriptions.send_modify(|n| *n += 1);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
