// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus exposition over HTTP.
//!
//! Each service registers its collectors on a [`prometheus::Registry`] and
//! calls [`serve`] to expose them at `GET /metrics`. Anything else is 404.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::task::JoinHandle;

async fn handle(req: Request<Body>, registry: Registry) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut res = Response::new(Body::from("not found"));
        *res.status_mut() = StatusCode::NOT_FOUND;
        return Ok(res);
    }
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let res = match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => Response::builder()
            .header("Content-Type", encoder.format_type())
            .body(Body::from(buffer))
            .expect("valid response"),
        Err(e) => {
            let mut res = Response::new(Body::from(e.to_string()));
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            res
        }
    };
    Ok(res)
}

/// Serves the metrics in `registry` on `addr` until the process exits.
///
/// Returns the handle of the spawned server task. Binding failures surface as
/// an error from that task rather than a panic here, so callers decide whether
/// a missing metrics endpoint is fatal.
pub fn serve(addr: SocketAddr, registry: Registry) -> JoinHandle<Result<(), hyper::Error>> {
    crate::task::spawn(
        || format!("metrics_http_server({addr})"),
        async move {
            let make_svc = make_service_fn(move |_conn| {
                let registry = registry.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| handle(req, registry.clone())))
                }
            });
            tracing::info!("serving metrics at http://{}/metrics", addr);
            Server::try_bind(&addr)?.serve(make_svc).await
        },
    )
}
