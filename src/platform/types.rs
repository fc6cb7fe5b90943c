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

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle action emitted by Incus once an instance has started.
pub const INSTANCE_STARTED: &str = "instance-started";
/// Lifecycle action emitted by Incus once an instance has restarted.
pub const INSTANCE_RESTARTED: &str = "instance-restarted";

/// Event type carrying [EventLifecycle] metadata.
pub const EVENT_TYPE_LIFECYCLE: &str = "lifecycle";

// Incus status codes; anything else counts as active.
const STATUS_STOPPED: i32 = 102;
const STATUS_ERROR: i32 = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    Any,
    #[default]
    Container,
    VirtualMachine,
}

impl InstanceType {
    /// The value of the `instance-type` query filter, if any.
    pub fn as_filter(&self) -> Option<&'static str> {
        match self {
            InstanceType::Any => None,
            InstanceType::Container => Some("container"),
            InstanceType::VirtualMachine => Some("virtual-machine"),
        }
    }
}

impl FromStr for InstanceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "any" => Ok(InstanceType::Any),
            "container" => Ok(InstanceType::Container),
            "virtual-machine" => Ok(InstanceType::VirtualMachine),
            other => Err(format!("unknown instance type {other:?}")),
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter().unwrap_or("any"))
    }
}

/// An instance as returned by the inventory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i32,
    #[serde(rename = "type", default)]
    pub instance_type: String,
}

/// An instance together with its live state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFull {
    #[serde(flatten)]
    pub instance: Instance,
    #[serde(default)]
    pub state: Option<InstanceState>,
}

impl InstanceFull {
    pub fn is_active(&self) -> bool {
        !matches!(self.instance.status_code, STATUS_STOPPED | STATUS_ERROR)
    }

    /// Network state, present only while the instance is active.
    pub fn network(&self) -> Option<&BTreeMap<String, InstanceNetwork>> {
        if !self.is_active() {
            return None;
        }
        self.state.as_ref().and_then(|s| s.network.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub network: Option<BTreeMap<String, InstanceNetwork>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceNetwork {
    #[serde(default)]
    pub addresses: Vec<InstanceNetworkAddress>,
    #[serde(rename = "type", default)]
    pub network_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceNetworkAddress {
    pub family: String,
    pub address: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub scope: String,
}

/// A raw event from the event stream. The metadata is decoded lazily based on `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Event {
    /// Decodes the metadata of a lifecycle event. Only a JSON object is accepted;
    /// serde would otherwise read an array positionally into the struct fields.
    pub fn lifecycle(&self) -> Result<EventLifecycle, serde_json::Error> {
        if !self.metadata.is_object() {
            return Err(serde::de::Error::invalid_type(
                unexpected(&self.metadata),
                &"a lifecycle metadata object",
            ));
        }
        EventLifecycle::deserialize(&self.metadata)
    }
}

fn unexpected(value: &serde_json::Value) -> serde::de::Unexpected<'_> {
    use serde::de::Unexpected;
    match value {
        serde_json::Value::Null => Unexpected::Unit,
        serde_json::Value::Bool(b) => Unexpected::Bool(*b),
        serde_json::Value::Number(_) => Unexpected::Other("number"),
        serde_json::Value::String(s) => Unexpected::Str(s),
        serde_json::Value::Array(_) => Unexpected::Seq,
        serde_json::Value::Object(_) => Unexpected::Map,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLifecycle {
    pub action: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub name: String,
}

/// The envelope every Incus API response is wrapped in.
#[derive(Debug, Deserialize)]
pub(super) struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub response_type: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: u16,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANCE_FULL: &str = r#"{
        "name": "web1",
        "project": "default",
        "status": "Running",
        "status_code": 103,
        "type": "container",
        "config": {
            "image.os": "Debian",
            "user.caddyserver.http.enable": "true"
        },
        "state": {
            "status": "Running",
            "network": {
                "eth0": {
                    "type": "broadcast",
                    "addresses": [
                        {"family": "inet", "address": "192.168.1.10", "netmask": "24", "scope": "global"},
                        {"family": "inet6", "address": "fe80::1", "netmask": "64", "scope": "link"}
                    ]
                },
                "lo": {
                    "type": "loopback",
                    "addresses": [
                        {"family": "inet", "address": "127.0.0.1", "netmask": "8", "scope": "local"}
                    ]
                }
            }
        }
    }"#;

    #[test]
    fn decode_instance_full() {
        let full: InstanceFull = serde_json::from_str(INSTANCE_FULL).unwrap();
        assert_eq!(full.instance.name, "web1");
        assert_eq!(
            full.instance.config.get("user.caddyserver.http.enable"),
            Some(&"true".to_string())
        );
        assert!(full.is_active());
        let network = full.network().unwrap();
        assert_eq!(network.len(), 2);
        assert_eq!(network["lo"].network_type, "loopback");
        assert_eq!(network["eth0"].addresses[0].address, "192.168.1.10");
    }

    #[test]
    fn stopped_instance_has_no_network() {
        let mut full: InstanceFull = serde_json::from_str(INSTANCE_FULL).unwrap();
        full.instance.status_code = STATUS_STOPPED;
        assert!(!full.is_active());
        assert!(full.network().is_none());
        full.instance.status_code = STATUS_ERROR;
        assert!(full.network().is_none());
    }

    #[test]
    fn decode_lifecycle_event() {
        let raw = r#"{
            "type": "lifecycle",
            "timestamp": "2024-01-01T00:00:00Z",
            "project": "default",
            "location": "none",
            "metadata": {"action": "instance-started", "source": "/1.0/instances/web1", "name": "web1"}
        }"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, EVENT_TYPE_LIFECYCLE);
        let lifecycle = event.lifecycle().unwrap();
        assert_eq!(lifecycle.action, INSTANCE_STARTED);
        assert_eq!(lifecycle.name, "web1");
    }

    #[test]
    fn undecodable_lifecycle_metadata() {
        let event = Event {
            event_type: EVENT_TYPE_LIFECYCLE.to_string(),
            timestamp: String::new(),
            project: String::new(),
            location: String::new(),
            metadata: serde_json::json!(["instance-started", "/1.0/instances/web1", "web1"]),
        };
        let err = event.lifecycle().unwrap_err();
        assert!(err.to_string().contains("sequence"), "{err}");

        for metadata in [serde_json::Value::Null, serde_json::json!("web1")] {
            let event = Event { metadata, ..event.clone() };
            assert!(event.lifecycle().is_err());
        }
    }

    #[test]
    fn instance_type_filter() {
        assert_eq!("any".parse::<InstanceType>(), Ok(InstanceType::Any));
        assert_eq!(InstanceType::Any.as_filter(), None);
        assert_eq!(
            "virtual-machine".parse::<InstanceType>().unwrap().as_filter(),
            Some("virtual-machine")
        );
        assert!("vm".parse::<InstanceType>().is_err());
        assert_eq!(InstanceType::default().to_string(), "container");
    }
}
