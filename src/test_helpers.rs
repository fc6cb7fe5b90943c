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
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::config::{self, Config};
use crate::platform::{
    EVENT_TYPE_LIFECYCLE, Event, Instance, InstanceFull, InstanceNetwork, InstanceNetworkAddress,
    InstanceState,
};
use crate::reconcile::{USER_CONFIG_ENABLE, USER_CONFIG_UPSTREAM_PORT};
use crate::state::matcher::USER_CONFIG_MATCH_HOST;

pub mod helpers;
pub mod mock;

pub use mock::MockServer;

pub const DEFAULT_PROJECT: &str = "default";

const STATUS_RUNNING: i32 = 103;

pub fn test_config() -> Config {
    Config {
        // Never bind a public address or a fixed port in tests.
        admin_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        reconnect_backoff: Duration::from_millis(500),
        platform_timeout: Duration::from_secs(1),
        termination_grace_period: Duration::from_secs(1),
        ..config::construct_config(|_| None).expect("default config is valid")
    }
}

/// Builds a running container in the default project with the given config and an `eth0`
/// interface carrying `addresses` (global scope). A loopback interface is always present.
pub fn instance(name: &str, config: &[(&str, &str)], addresses: &[&str]) -> InstanceFull {
    let mut network = BTreeMap::new();
    network.insert(
        "eth0".to_string(),
        InstanceNetwork {
            addresses: addresses
                .iter()
                .map(|a| {
                    let family = if a.contains(':') { "inet6" } else { "inet" };
                    address(family, a, "global")
                })
                .collect(),
            network_type: "broadcast".to_string(),
        },
    );
    network.insert(
        "lo".to_string(),
        InstanceNetwork {
            addresses: vec![address("inet", "127.0.0.1", "local")],
            network_type: "loopback".to_string(),
        },
    );
    InstanceFull {
        instance: Instance {
            name: name.to_string(),
            project: DEFAULT_PROJECT.to_string(),
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            status: "Running".to_string(),
            status_code: STATUS_RUNNING,
            instance_type: "container".to_string(),
        },
        state: Some(InstanceState {
            status: "Running".to_string(),
            network: Some(network),
        }),
    }
}

/// An enabled instance routing `host` to `address:port`.
pub fn web_instance(name: &str, host: &str, port: &str, address: &str) -> InstanceFull {
    instance(
        name,
        &[
            (USER_CONFIG_ENABLE, "true"),
            (USER_CONFIG_MATCH_HOST, host),
            (USER_CONFIG_UPSTREAM_PORT, port),
        ],
        &[address],
    )
}

pub fn address(family: &str, address: &str, scope: &str) -> InstanceNetworkAddress {
    InstanceNetworkAddress {
        family: family.to_string(),
        address: address.to_string(),
        netmask: if family == "inet" { "24" } else { "64" }.to_string(),
        scope: scope.to_string(),
    }
}

pub fn lifecycle_event(action: &str, name: &str) -> Event {
    Event {
        event_type: EVENT_TYPE_LIFECYCLE.to_string(),
        timestamp: "2024-01-01T00:00:00Z".to_string(),
        project: DEFAULT_PROJECT.to_string(),
        location: "none".to_string(),
        metadata: serde_json::json!({
            "action": action,
            "source": format!("/1.0/instances/{name}"),
            "name": name,
        }),
    }
}
