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

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::drain::DrainWatcher;
use crate::signal;

pub type Body = Full<Bytes>;

pub fn empty_response(code: StatusCode) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::default())
        .expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(body.into())
        .expect("builder with known status code should not fail")
}

pub fn json_response<T: Serialize + ?Sized>(code: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec_pretty(body) {
        Ok(body) => Response::builder()
            .status(code)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .expect("builder with known status code should not fail"),
        Err(err) => plaintext_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode response: {err}\n"),
        ),
    }
}

/// Server implements a generic HTTP server with the follow behavior:
/// * HTTP/1.1 plaintext only
/// * Draining
/// * Triggers the app to shutdown on errors
pub struct Server<S> {
    name: String,
    addr: SocketAddr,
    listener: TcpListener,
    shutdown_trigger: signal::ShutdownTrigger,
    drain_rx: DrainWatcher,
    state: Arc<S>,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        shutdown_trigger: signal::ShutdownTrigger,
        drain_rx: DrainWatcher,
        s: S,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Server {
            name: name.to_string(),
            addr,
            listener,
            shutdown_trigger,
            drain_rx,
            state: Arc::new(s),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn spawn<F, R>(self, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Response<Body>> + Send + 'static,
    {
        let Server {
            name,
            addr,
            listener,
            shutdown_trigger,
            drain_rx,
            state,
        } = self;
        let f = Arc::new(f);

        info!(address=%addr, component=name, "listener established");
        tokio::spawn(async move {
            let graceful = GracefulShutdown::new();
            let drain = drain_rx.wait_for_drain();
            tokio::pin!(drain);
            let blocker = loop {
                tokio::select! {
                    blocker = &mut drain => break blocker,
                    res = listener.accept() => match res {
                        Ok((stream, remote)) => {
                            let state = state.clone();
                            let f = f.clone();
                            let svc = service_fn(move |req| {
                                let fut = f(state.clone(), req);
                                async move { Ok::<_, Infallible>(fut.await) }
                            });
                            let conn = http1::Builder::new()
                                .timer(TokioTimer::new())
                                .half_close(true)
                                .header_read_timeout(Duration::from_secs(2))
                                .max_buf_size(8 * 1024)
                                .serve_connection(TokioIo::new(stream), svc);
                            let conn = graceful.watch(conn);
                            let name = name.clone();
                            tokio::spawn(async move {
                                if let Err(err) = conn.await {
                                    debug!(%remote, "{name} connection closed with error: {err}");
                                }
                            });
                        }
                        Err(err) => {
                            error!("serving {name} failed: {err}");
                            shutdown_trigger.shutdown_now().await;
                            break (&mut drain).await;
                        }
                    }
                }
            };
            info!("starting drain of {name} server");
            graceful.shutdown().await;
            // Connections are closed; release the drain.
            drop(blocker);
            info!("{name} server terminated");
        });
    }
}
