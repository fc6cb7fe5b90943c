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

use std::collections::HashMap;
use std::time::Duration;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use http::Request;
use http::header::HOST;

use incus_upstreams::state::matcher::{MatcherSet, USER_CONFIG_MATCH_HOST};
use incus_upstreams::state::{Candidate, CandidateStore};
use incus_upstreams::strng;

const CANDIDATES: usize = 1000;

fn store() -> CandidateStore {
    let store = CandidateStore::default();
    store.replace(candidates());
    store
}

fn candidates() -> Vec<Candidate> {
    (0..CANDIDATES)
        .map(|i| {
            let config = HashMap::from([(
                USER_CONFIG_MATCH_HOST.to_string(),
                format!("svc{i}.example.com *.svc{i}.example.org"),
            )]);
            Candidate::new(
                MatcherSet::build(&config),
                strng::new(format!("10.0.{}.{}:8080", i / 256, i % 256)),
            )
        })
        .collect()
}

pub fn matching(c: &mut Criterion) {
    let mut c = c.benchmark_group("matching");
    c.measurement_time(Duration::from_secs(5));
    c.throughput(Throughput::Elements(CANDIDATES as u64));
    let store = store();
    let hit = Request::builder()
        .header(HOST, "www.svc500.example.org:443")
        .body(())
        .unwrap();
    let miss = Request::builder()
        .header(HOST, "unknown.example.net")
        .body(())
        .unwrap();
    c.bench_function("hit", |b| {
        b.iter(|| {
            let res = store.matching(&hit);
            assert_eq!(res.len(), 1);
        })
    });
    c.bench_function("miss", |b| {
        b.iter(|| {
            let res = store.matching(&miss);
            assert!(res.is_empty());
        })
    });
}

pub fn replace(c: &mut Criterion) {
    let mut c = c.benchmark_group("replace");
    c.measurement_time(Duration::from_secs(5));
    let store = store();
    c.bench_function("snapshot", |b| {
        b.iter_batched(
            candidates,
            |next| store.replace(next),
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = matching, replace
}

criterion_main!(benches);
