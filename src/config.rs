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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::platform::InstanceType;

const INCUS_SOCKET: &str = "INCUS_SOCKET";
const INCUS_DIR: &str = "INCUS_DIR";
const INSTANCE_TYPE: &str = "INSTANCE_TYPE";
const RECONNECT_BACKOFF: &str = "RECONNECT_BACKOFF";
const PLATFORM_TIMEOUT: &str = "PLATFORM_TIMEOUT";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const ADMIN_ADDR: &str = "ADMIN_ADDR";
const WORKER_THREADS: &str = "WORKER_THREADS";

const DEFAULT_INCUS_DIR: &str = "/var/lib/incus";
const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_PLATFORM_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_ADMIN_PORT: u16 = 15000;
const DEFAULT_WORKER_THREADS: usize = 2;

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Unix socket of the Incus daemon.
    pub incus_socket: PathBuf,
    /// Only instances of this type are considered.
    pub instance_type: InstanceType,
    /// Delay before re-subscribing to the event stream.
    pub reconnect_backoff: Duration,
    /// Upper bound for every call to the Incus daemon.
    pub platform_timeout: Duration,
    pub termination_grace_period: Duration,

    /// Admin API; serves readiness, metrics and upstream dumps.
    pub admin_addr: SocketAddr,

    /// Specify the number of worker threads the Tokio Runtime will use.
    pub num_worker_threads: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
}

/// HumanDuration parses durations such as "500ms" or "1m30s".
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s).map(HumanDuration).map_err(|_| ())
    }
}

fn parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, Error> {
    match env(key) {
        Some(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(key.to_string(), val)),
        None => Ok(None),
    }
}

fn parse_default<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, Error> {
    parse(env, key).map(|v| v.unwrap_or(default))
}

fn parse_duration(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, Error> {
    Ok(parse::<HumanDuration>(env, key)?.map(|d| d.0).unwrap_or(default))
}

fn empty_to_none(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

fn socket_path(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(socket) = empty_to_none(env(INCUS_SOCKET)) {
        return PathBuf::from(socket);
    }
    let dir = empty_to_none(env(INCUS_DIR)).unwrap_or_else(|| DEFAULT_INCUS_DIR.to_string());
    PathBuf::from(dir).join("unix.socket")
}

pub fn parse_config() -> Result<Config, Error> {
    construct_config(|key| std::env::var(key).ok())
}

/// Builds the config from `env`, a lookup of environment variables by name.
pub fn construct_config(env: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
    Ok(Config {
        incus_socket: socket_path(&env),
        instance_type: parse_default(&env, INSTANCE_TYPE, InstanceType::Container)?,
        reconnect_backoff: parse_duration(&env, RECONNECT_BACKOFF, DEFAULT_RECONNECT_BACKOFF)?,
        platform_timeout: parse_duration(&env, PLATFORM_TIMEOUT, DEFAULT_PLATFORM_TIMEOUT)?,
        termination_grace_period: parse_duration(
            &env,
            TERMINATION_GRACE_PERIOD,
            DEFAULT_DRAIN_DURATION,
        )?,
        // admin API should only be accessible over localhost
        admin_addr: parse_default(
            &env,
            ADMIN_ADDR,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_ADMIN_PORT),
        )?,
        num_worker_threads: parse_default(&env, WORKER_THREADS, DEFAULT_WORKER_THREADS)?,
    })
}
