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

use std::collections::{BTreeMap, BTreeSet};

use crate::platform::InstanceNetwork;

const LOOPBACK: &str = "loopback";
const FAMILY_INET: &str = "inet";
const EXCLUDED_SCOPES: [&str; 2] = ["link", "local"];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("no routable ipv4 address found")]
pub struct NotFound;

/// Selects the address to dial for an instance.
///
/// Loopback interfaces and link/local scoped addresses are ignored, and only IPv4 (`inet`)
/// addresses are considered. Of the remaining addresses, the greatest one by *string* ordering
/// wins. This is not numeric ordering: "10.0.0.5" is preferred over "10.0.0.20". The choice
/// only needs to be stable across calls so that unchanged instances produce identical candidates.
pub fn resolve(network: &BTreeMap<String, InstanceNetwork>) -> Result<String, NotFound> {
    let candidates: BTreeSet<&str> = network
        .values()
        .filter(|net| net.network_type != LOOPBACK)
        .flat_map(|net| net.addresses.iter())
        .filter(|addr| !EXCLUDED_SCOPES.contains(&addr.scope.as_str()))
        .filter(|addr| addr.family == FAMILY_INET)
        .map(|addr| addr.address.as_str())
        .collect();

    candidates
        .into_iter()
        .next_back()
        .map(str::to_string)
        .ok_or(NotFound)
}
