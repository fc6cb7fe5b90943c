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

//! Request matchers built from instance configuration.
//!
//! Each recognized configuration key maps to a [MatcherKind]. Building a [MatcherSet] walks
//! [REGISTRY] in order, so the same configuration always yields the same set.

use std::collections::HashMap;

use http::header::HOST;
use http::request::Parts;
use http::{HeaderMap, Request, Uri};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::metrics::MatcherRejection;

/// Instance configuration key holding the host pattern(s) to match.
pub const USER_CONFIG_MATCH_HOST: &str = "user.caddyserver.http.matchers.host";

/// Configuration keys that produce a matcher, in evaluation order.
pub const REGISTRY: &[(&str, MatcherKind)] = &[(USER_CONFIG_MATCH_HOST, MatcherKind::Host)];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no host patterns in {0:?}")]
    EmptyHosts(String),
    #[error("no usable host pattern in {0:?}")]
    NoUsableHost(String),
}

impl Error {
    pub fn kind(&self) -> MatcherRejection {
        match self {
            Error::EmptyHosts(_) => MatcherRejection::EmptyHosts,
            Error::NoUsableHost(_) => MatcherRejection::NoUsableHost,
        }
    }
}

/// The parts of a request that matchers look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

impl<'a, B> From<&'a Request<B>> for RequestHead<'a> {
    fn from(req: &'a Request<B>) -> Self {
        RequestHead {
            uri: req.uri(),
            headers: req.headers(),
        }
    }
}

impl<'a> From<&'a Parts> for RequestHead<'a> {
    fn from(parts: &'a Parts) -> Self {
        RequestHead {
            uri: &parts.uri,
            headers: &parts.headers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Host,
}

impl MatcherKind {
    pub fn build(self, value: &str) -> Result<Matcher, Error> {
        match self {
            MatcherKind::Host => HostMatcher::parse(value).map(Matcher::Host),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    Host(HostMatcher),
}

impl Matcher {
    /// Prepares the matcher for use. A matcher that fails to provision must not be used.
    pub fn provision(&mut self) -> Result<(), Error> {
        match self {
            Matcher::Host(h) => h.provision(),
        }
    }

    pub fn matches(&self, req: RequestHead<'_>) -> bool {
        match self {
            Matcher::Host(h) => h.matches(req),
        }
    }
}

/// An ordered set of matchers which must all match. An empty set matches every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MatcherSet(Vec<Matcher>);

impl MatcherSet {
    /// Builds the matchers for every recognized key present in `config`.
    /// Matchers that cannot be built or provisioned are logged and left out.
    pub fn build(config: &HashMap<String, String>) -> MatcherSet {
        Self::build_reporting(config, |_| {})
    }

    /// Like [MatcherSet::build], additionally passing every rejected matcher's error to `rejected`.
    pub fn build_reporting(
        config: &HashMap<String, String>,
        mut rejected: impl FnMut(&Error),
    ) -> MatcherSet {
        let mut matchers = Vec::new();
        for (key, kind) in REGISTRY {
            let Some(value) = config.get(*key) else {
                continue;
            };
            let mut matcher = match kind.build(value) {
                Ok(m) => m,
                Err(e) => {
                    warn!(%key, %value, "unable to load matcher: {e}");
                    rejected(&e);
                    continue;
                }
            };
            if let Err(e) = matcher.provision() {
                warn!(%key, %value, "unable to provision matcher: {e}");
                rejected(&e);
                continue;
            }
            trace!(%key, %value, "loaded matcher");
            matchers.push(matcher);
        }
        MatcherSet(matchers)
    }

    pub fn matches<'a>(&self, req: impl Into<RequestHead<'a>>) -> bool {
        let req = req.into();
        self.0.iter().all(|m| m.matches(req))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Matcher> {
        self.0.iter()
    }
}

impl FromIterator<Matcher> for MatcherSet {
    fn from_iter<T: IntoIterator<Item = Matcher>>(iter: T) -> Self {
        MatcherSet(iter.into_iter().collect())
    }
}

/// Matches the request host against one or more patterns.
///
/// Patterns are separated by commas or whitespace. A `*` label matches exactly one label
/// of the request host, so `*.example.com` matches `www.example.com` but neither
/// `example.com` nor `a.b.example.com`. Comparison ignores case and any port.
///
/// Provisioning normalizes patterns rather than rejecting them: a pattern that can never
/// match a real host simply never matches. Only a value without any usable host fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HostMatcher {
    hosts: Vec<String>,
}

impl HostMatcher {
    pub fn parse(value: &str) -> Result<Self, Error> {
        let hosts: Vec<String> = value
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if hosts.is_empty() {
            return Err(Error::EmptyHosts(value.to_string()));
        }
        Ok(HostMatcher { hosts })
    }

    pub fn provision(&mut self) -> Result<(), Error> {
        let mut hosts = Vec::with_capacity(self.hosts.len());
        for pattern in &self.hosts {
            match normalize(pattern) {
                Some(host) if !hosts.contains(&host) => hosts.push(host),
                Some(_) => {}
                None => debug!(%pattern, "dropping unusable host pattern"),
            }
        }
        if hosts.is_empty() {
            return Err(Error::NoUsableHost(self.hosts.join(",")));
        }
        self.hosts = hosts;
        Ok(())
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn matches<'a>(&self, req: impl Into<RequestHead<'a>>) -> bool {
        let Some(host) = request_host(req.into()) else {
            return false;
        };
        let host = strip_port(host).trim_end_matches('.');
        self.hosts.iter().any(|pattern| host_matches(pattern, host))
    }
}

// Lowercases and strips any port and trailing dot. None if nothing is left.
fn normalize(pattern: &str) -> Option<String> {
    let host = strip_port(pattern.trim()).trim_end_matches('.');
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

// HTTP/2 requests carry the host in the URI authority rather than a Host header.
fn request_host(req: RequestHead<'_>) -> Option<&str> {
    req.headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri.host())
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(i) => &host[..i + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !h.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if !pattern.contains('*') {
        return pattern.eq_ignore_ascii_case(host);
    }
    let mut want = pattern.split('.');
    let mut got = host.split('.');
    loop {
        match (want.next(), got.next()) {
            (None, None) => return true,
            (Some("*"), Some(label)) if !label.is_empty() => {}
            (Some(w), Some(label)) if w.eq_ignore_ascii_case(label) => {}
            _ => return false,
        }
    }
}
