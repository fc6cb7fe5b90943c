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

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::config::Config;
use crate::drain::DrainTrigger;
use crate::metrics::Metrics;
use crate::platform::{IncusClient, InstanceServer};
use crate::upstreams::Upstreams;
use crate::{admin, drain, readiness, signal};

/// Connects to the Incus daemon and starts discovery.
pub async fn build(config: Config) -> anyhow::Result<Bound> {
    let client = IncusClient::connect(config.incus_socket.clone())
        .await
        .with_context(|| {
            format!(
                "failed to connect to incus at {}",
                config.incus_socket.display()
            )
        })?;
    info!(socket=%client.socket().display(), "connected to incus");
    build_with_platform(config, Arc::new(client)).await
}

/// Starts the admin server, runs the initial reconciliation against `platform` and leaves the
/// event watcher running in the background.
pub async fn build_with_platform(
    config: Config,
    platform: Arc<dyn InstanceServer>,
) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::from(&mut registry));
    let registry = Arc::new(Mutex::new(registry));

    let shutdown = signal::Shutdown::new();
    let ready = readiness::Ready::new();
    let initial_reconciliation = ready.register_task("initial reconciliation");
    let (drain_tx, drain_rx) = drain::new();

    let upstreams = Upstreams::default();

    let admin = admin::Service::new(
        config.clone(),
        upstreams.clone(),
        ready.clone(),
        registry,
        shutdown.trigger(),
        drain_rx.clone(),
    )
    .await?;
    let admin_address = admin.address();
    admin.spawn();

    let watcher = upstreams
        .provision(platform, &config, metrics, drain_rx)
        .await
        .context("initial reconciliation failed")?;
    drop(initial_reconciliation);

    Ok(Bound {
        admin_address,
        upstreams,
        shutdown,
        config,
        drain_tx,
        watcher,
    })
}

pub struct Bound {
    pub admin_address: SocketAddr,
    pub upstreams: Upstreams,

    pub shutdown: signal::Shutdown,
    config: Config,
    drain_tx: DrainTrigger,
    watcher: JoinHandle<()>,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        // Wait for a signal to shutdown from explicit admin shutdown or signal
        self.shutdown.wait().await;

        // Start a drain; this will wait for all drain_rx handles to be dropped before completing,
        // allowing components to terminate.
        // If they take too long, terminate anyways.
        match time::timeout(
            self.config.termination_grace_period,
            self.drain_tx.start_drain_and_wait(),
        )
        .await
        {
            Ok(()) => info!("Shutdown completed gracefully"),
            Err(_) => {
                warn!(
                    "Graceful shutdown did not complete in {:?}, terminating now",
                    self.config.termination_grace_period
                );
                self.watcher.abort();
            }
        }
        Ok(())
    }
}
