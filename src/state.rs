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
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::debug;

use crate::state::matcher::{MatcherSet, RequestHead};
use crate::strng::Strng;

pub mod address;
pub mod matcher;

/// A routable backend: requests matching every matcher are sent to `dial`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub matchers: MatcherSet,
    pub dial: Strng,
}

impl Candidate {
    pub fn new(matchers: MatcherSet, dial: Strng) -> Self {
        Candidate { matchers, dial }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Candidate{{{} with {} matchers}}",
            self.dial,
            self.matchers.len()
        )
    }
}

/// Snapshot is the complete candidate list in effect at one instant. It is never mutated.
pub type Snapshot = Arc<[Candidate]>;

/// CandidateStore holds the current [Snapshot].
///
/// Writers build a whole new snapshot and swap it in; readers scan whichever snapshot was
/// current when they took the read lock. A reader therefore never sees a mix of two snapshots.
#[derive(Debug)]
pub struct CandidateStore {
    snapshot: RwLock<Snapshot>,
}

impl Default for CandidateStore {
    fn default() -> Self {
        CandidateStore {
            snapshot: RwLock::new(Arc::from(Vec::new())),
        }
    }
}

impl CandidateStore {
    /// Atomically replaces the current snapshot with `candidates`.
    pub fn replace(&self, candidates: Vec<Candidate>) {
        let next: Snapshot = candidates.into();
        let size = next.len();
        let prev = std::mem::replace(&mut *self.snapshot.write().unwrap(), next);
        // The write lock is released; freeing the old snapshot happens outside of it.
        drop(prev);
        debug!(candidates = size, "replaced candidate snapshot");
    }

    /// Returns the dial target of every candidate matching `req`, in snapshot order.
    pub fn matching<'a>(&self, req: impl Into<RequestHead<'a>>) -> Vec<Strng> {
        let req = req.into();
        let snapshot = self.snapshot.read().unwrap();
        snapshot
            .iter()
            .filter(|c| c.matchers.matches(req))
            .map(|c| c.dial.clone())
            .collect()
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
