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

//! Reconciliation turns the platform's instance inventory into a fresh candidate snapshot.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::metrics::{IncrementRecorder, Metrics, ReconcileOutcome, SkipKind};
use crate::platform::{self, Instance, InstanceServer, InstanceType, with_timeout};
use crate::state::address;
use crate::state::matcher::MatcherSet;
use crate::state::{Candidate, CandidateStore};
use crate::strng;

/// Enables upstream discovery for an instance. Must be exactly `"true"`.
pub const USER_CONFIG_ENABLE: &str = "user.caddyserver.http.enable";
/// The port the instance serves on.
pub const USER_CONFIG_UPSTREAM_PORT: &str = "user.caddyserver.http.upstream.port";

/// Why an instance produced no candidate.
#[derive(thiserror::Error, Debug)]
pub enum SkipReason {
    #[error("{USER_CONFIG_ENABLE} is not set")]
    NotEnabled,
    #[error("{USER_CONFIG_ENABLE} is {0:?}, not \"true\"")]
    Disabled(String),
    #[error("{USER_CONFIG_UPSTREAM_PORT} is not set")]
    NoPort,
    #[error("instance state unavailable: {0}")]
    StateUnavailable(#[source] platform::Error),
    #[error("no routable address")]
    NoAddress,
}

impl SkipReason {
    pub fn kind(&self) -> SkipKind {
        match self {
            SkipReason::NotEnabled | SkipReason::Disabled(_) => SkipKind::Disabled,
            SkipReason::NoPort => SkipKind::NoPort,
            SkipReason::StateUnavailable(_) => SkipKind::StateUnavailable,
            SkipReason::NoAddress => SkipKind::NoAddress,
        }
    }
}

/// Reconciler rebuilds the [CandidateStore] from the platform inventory.
#[derive(Clone)]
pub struct Reconciler {
    platform: Arc<dyn InstanceServer>,
    store: Arc<CandidateStore>,
    instance_type: InstanceType,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        platform: Arc<dyn InstanceServer>,
        store: Arc<CandidateStore>,
        instance_type: InstanceType,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Reconciler {
            platform,
            store,
            instance_type,
            timeout,
            metrics,
        }
    }

    /// Runs one full pass: list, build, replace. Returns the number of candidates now in the
    /// store. If the inventory cannot be listed the previous snapshot stays in place.
    pub async fn reconcile(&self) -> Result<usize, platform::Error> {
        let instances = match with_timeout(
            "list instances",
            self.timeout,
            self.platform.list_instances(self.instance_type),
        )
        .await
        {
            Ok(instances) => instances,
            Err(err) => {
                self.metrics.increment(&ReconcileOutcome::Failure);
                return Err(err);
            }
        };

        let mut candidates = Vec::with_capacity(instances.len());
        for instance in &instances {
            match self.build_candidate(instance).await {
                Ok(candidate) => {
                    debug!(instance=%instance.name, project=%instance.project, %candidate, "built candidate");
                    candidates.push(candidate);
                }
                // Most instances never opt in; only misconfiguration is worth a warning.
                Err(reason @ SkipReason::NotEnabled) => {
                    debug!(instance=%instance.name, project=%instance.project, %reason, "skipping instance");
                    self.metrics.increment(&reason.kind());
                }
                Err(reason) => {
                    warn!(instance=%instance.name, project=%instance.project, %reason, "skipping instance");
                    self.metrics.increment(&reason.kind());
                }
            }
        }

        let count = candidates.len();
        self.store.replace(candidates);
        self.metrics.set_candidates(count);
        self.metrics.increment(&ReconcileOutcome::Success);
        info!(
            instances = instances.len(),
            candidates = count,
            "reconciled upstreams"
        );
        Ok(count)
    }

    /// Builds the candidate for a single instance, if it is eligible.
    pub async fn build_candidate(&self, instance: &Instance) -> Result<Candidate, SkipReason> {
        match instance.config.get(USER_CONFIG_ENABLE) {
            None => return Err(SkipReason::NotEnabled),
            Some(v) if v != "true" => return Err(SkipReason::Disabled(v.clone())),
            Some(_) => {}
        }

        let port = match instance.config.get(USER_CONFIG_UPSTREAM_PORT) {
            Some(p) if !p.is_empty() => p,
            _ => return Err(SkipReason::NoPort),
        };
        debug!(instance=%instance.name, %port, "port retrieved");

        let matchers = MatcherSet::build_reporting(&instance.config, |err| {
            self.metrics.increment(&err.kind())
        });

        let full = with_timeout(
            "get instance state",
            self.timeout,
            self.platform
                .get_instance_full(&instance.project, &instance.name),
        )
        .await
        .map_err(SkipReason::StateUnavailable)?;

        let network = full.network().ok_or(SkipReason::NoAddress)?;
        let addr = address::resolve(network).map_err(|_| SkipReason::NoAddress)?;
        debug!(instance=%instance.name, address=%addr, "address retrieved");

        Ok(Candidate::new(
            matchers,
            strng::new(join_host_port(&addr, port)),
        ))
    }
}

/// Joins a host and port into a dial target, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}
