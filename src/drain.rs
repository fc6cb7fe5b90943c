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

//! Drain coordinates graceful termination of background work.
//!
//! The [DrainTrigger] starts a drain and waits until every [DrainWatcher] clone has been dropped.
//! Long running tasks hold a watcher, select on [DrainWatcher::wait_for_drain], and drop the
//! returned [DrainBlocker] once they have cleaned up.

use tokio::sync::{mpsc, watch};

/// Creates a connected trigger and watcher.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    let (signal_tx, signal_rx) = watch::channel(false);
    let (drained_tx, drained_rx) = mpsc::channel(1);
    (
        DrainTrigger {
            drained_rx,
            signal_tx,
        },
        DrainWatcher {
            drained_tx,
            signal_rx,
        },
    )
}

enum Never {}

/// Starts a drain.
pub struct DrainTrigger {
    drained_rx: mpsc::Receiver<Never>,
    signal_tx: watch::Sender<bool>,
}

/// Watches for a drain. A drain completes only once all watchers are dropped.
#[derive(Clone)]
pub struct DrainWatcher {
    drained_tx: mpsc::Sender<Never>,
    signal_rx: watch::Receiver<bool>,
}

/// Holding a DrainBlocker keeps the drain from completing.
#[must_use = "DrainBlocker should be dropped explicitly to release the drain"]
pub struct DrainBlocker(#[allow(dead_code)] mpsc::Sender<Never>);

impl DrainTrigger {
    /// Signals all watchers to start draining and waits for every watcher to be released.
    pub async fn start_drain_and_wait(mut self) {
        let _ = self.signal_tx.send(true);
        match self.drained_rx.recv().await {
            None => {}
            Some(n) => match n {},
        }
    }
}

impl DrainWatcher {
    /// Completes once a drain is signaled, or once the trigger is gone.
    pub async fn wait_for_drain(mut self) -> DrainBlocker {
        // An error means the trigger was dropped, which also means nobody is waiting on us.
        let _ = self.signal_rx.wait_for(|draining| *draining).await;
        DrainBlocker(self.drained_tx)
    }
}

impl std::fmt::Debug for DrainTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainTrigger").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for DrainWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainWatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn drain_waits_for_blockers() {
        let (trigger, watcher) = new();
        let (released_tx, released_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let blocker = watcher.wait_for_drain().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = released_tx.send(());
            drop(blocker);
        });
        tokio::time::timeout(Duration::from_secs(5), trigger.start_drain_and_wait())
            .await
            .expect("drain completes");
        // The blocker was released before the drain finished.
        released_rx.await.expect("task released blocker");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_trigger_releases_watchers() {
        let (trigger, watcher) = new();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(5), watcher.wait_for_drain())
            .await
            .expect("watcher released");
    }
}
