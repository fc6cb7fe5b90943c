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

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Metrics for upstream discovery.
pub struct Metrics {
    reconciliations: Family<Reconciliation, Counter>,
    skipped: Family<Skipped, Counter>,
    candidates: Gauge,
    connection_terminations: Family<ConnectionTermination, Counter>,
    events: Family<EventHandled, Counter>,
    matchers_rejected: Family<MatcherRejected, Counter>,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct Reconciliation {
    outcome: ReconcileOutcome,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum ReconcileOutcome {
    Success,
    Failure,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct Skipped {
    reason: SkipKind,
}

/// Why an instance did not produce a candidate.
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum SkipKind {
    Disabled,
    NoPort,
    StateUnavailable,
    NoAddress,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct ConnectionTermination {
    reason: ConnectionTerminationReason,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum ConnectionTerminationReason {
    SubscribeError,
    StreamError,
    Complete,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct EventHandled {
    disposition: EventDisposition,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum EventDisposition {
    Reconciled,
    Ignored,
    Undecodable,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct MatcherRejected {
    reason: MatcherRejection,
}

/// Why a configured matcher was left out of a candidate.
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum MatcherRejection {
    EmptyHosts,
    NoUsableHost,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let reconciliations = Family::default();
        registry.register(
            "reconciliations",
            "The total number of reconciliation passes, by outcome",
            reconciliations.clone(),
        );
        let skipped = Family::default();
        registry.register(
            "instances_skipped",
            "The total number of instances that produced no candidate, by reason",
            skipped.clone(),
        );
        let candidates = Gauge::default();
        registry.register(
            "candidates",
            "The number of candidates in the current snapshot",
            candidates.clone(),
        );
        let connection_terminations = Family::default();
        registry.register(
            "event_stream_terminations",
            "The total number of terminated event subscriptions, by reason",
            connection_terminations.clone(),
        );
        let events = Family::default();
        registry.register(
            "lifecycle_events",
            "The total number of received lifecycle events, by disposition",
            events.clone(),
        );
        let matchers_rejected = Family::default();
        registry.register(
            "matchers_rejected",
            "The total number of configured matchers that failed to build, by reason",
            matchers_rejected.clone(),
        );
        Self {
            reconciliations,
            skipped,
            candidates,
            connection_terminations,
            events,
            matchers_rejected,
        }
    }

    pub fn set_candidates(&self, count: usize) {
        self.candidates.set(count as i64);
    }

    pub fn candidates(&self) -> i64 {
        self.candidates.get()
    }
}

impl From<&mut Registry> for Metrics {
    fn from(registry: &mut Registry) -> Self {
        Metrics::new(registry.sub_registry_with_prefix("incus_upstreams"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        Metrics::from(&mut registry)
    }
}

pub trait Recorder<E, T> {
    /// Record the given event
    fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
    /// Record the given event by incrementing the counter by count
    fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
    R: Recorder<E, u64>,
{
    fn increment(&self, event: &E) {
        self.record(event, 1);
    }
}

impl Recorder<ReconcileOutcome, u64> for Metrics {
    fn record(&self, outcome: &ReconcileOutcome, count: u64) {
        self.reconciliations
            .get_or_create(&Reconciliation { outcome: *outcome })
            .inc_by(count);
    }
}

impl Recorder<SkipKind, u64> for Metrics {
    fn record(&self, reason: &SkipKind, count: u64) {
        self.skipped
            .get_or_create(&Skipped { reason: *reason })
            .inc_by(count);
    }
}

impl Recorder<ConnectionTerminationReason, u64> for Metrics {
    fn record(&self, reason: &ConnectionTerminationReason, count: u64) {
        self.connection_terminations
            .get_or_create(&ConnectionTermination { reason: *reason })
            .inc_by(count);
    }
}

impl Recorder<EventDisposition, u64> for Metrics {
    fn record(&self, disposition: &EventDisposition, count: u64) {
        self.events
            .get_or_create(&EventHandled {
                disposition: *disposition,
            })
            .inc_by(count);
    }
}

impl Recorder<MatcherRejection, u64> for Metrics {
    fn record(&self, reason: &MatcherRejection, count: u64) {
        self.matchers_rejected
            .get_or_create(&MatcherRejected { reason: *reason })
            .inc_by(count);
    }
}

#[cfg(test)]
mod tests {
    use prometheus_client::encoding::text::encode;

    use super::*;

    #[test]
    fn encodes_recorded_events() {
        let mut registry = Registry::default();
        let metrics = Metrics::from(&mut registry);
        metrics.increment(&ReconcileOutcome::Success);
        metrics.increment(&SkipKind::NoPort);
        metrics.increment(&ConnectionTerminationReason::SubscribeError);
        metrics.increment(&EventDisposition::Reconciled);
        metrics.increment(&MatcherRejection::NoUsableHost);
        metrics.set_candidates(3);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("incus_upstreams_reconciliations_total{outcome=\"Success\"} 1"));
        assert!(out.contains("incus_upstreams_instances_skipped_total{reason=\"NoPort\"} 1"));
        assert!(out.contains("incus_upstreams_candidates 3"));
        assert!(
            out.contains("incus_upstreams_matchers_rejected_total{reason=\"NoUsableHost\"} 1")
        );
        assert_eq!(metrics.candidates(), 3);
    }
}
