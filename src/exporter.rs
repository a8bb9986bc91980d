//! Prometheus exporter for the daemon (tiny_http, background thread).
//!
//! GET /metrics -> text exposition (metrics::render_prometheus)
//! GET /health  -> "OK"
//! Поток останавливается по CancelToken (recv_timeout опрашивает флаг).

use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use tiny_http::{Header, Request, Response, Server};

use crate::metrics;
use crate::scheduler::CancelToken;

const POLL: Duration = Duration::from_millis(200);

pub struct Exporter {
    addr: String,
    handle: JoinHandle<()>,
}

impl Exporter {
    /// Bind and start serving. Bind errors are returned, not logged.
    pub fn spawn(addr: &str, cancel: CancelToken) -> Result<Self> {
        let server = Server::http(addr).map_err(|e| anyhow!("bind http at {}: {}", addr, e))?;
        let bound = server
            .server_addr()
            .to_ip()
            .map(|a| a.to_string())
            .unwrap_or_else(|| addr.to_string());
        info!("metrics exporter listening on {}", bound);

        let handle = thread::Builder::new()
            .name("snapwarden-exporter".into())
            .spawn(move || serve(server, cancel))
            .context("spawn exporter thread")?;
        Ok(Self {
            addr: bound,
            handle,
        })
    }

    /// Actual bound address (useful with port 0).
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Wait for the thread after cancellation.
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("metrics exporter thread panicked");
        }
    }
}

fn serve(server: Server, cancel: CancelToken) {
    while !cancel.is_cancelled() {
        match server.recv_timeout(POLL) {
            Ok(Some(rq)) => handle(rq),
            Ok(None) => {}
            Err(e) => warn!("http recv error: {}", e),
        }
    }
    debug!("metrics exporter stopped");
}

fn handle(rq: Request) {
    let is_get = rq.method().as_str() == "GET";
    let url = rq.url().to_string();

    let resp = if is_get && (url == "/" || url == "/health") {
        Response::from_string("OK\n").with_status_code(200)
    } else if is_get && url == "/metrics" {
        let mut resp = Response::from_string(metrics::render_prometheus(&metrics::snapshot()));
        if let Ok(ct) = Header::from_bytes(&b"Content-Type"[..], &b"text/plain; version=0.0.4"[..]) {
            resp.add_header(ct);
        }
        resp
    } else {
        Response::from_string("not found\n").with_status_code(404)
    };
    if let Err(e) = rq.respond(resp) {
        debug!("http respond to {} failed: {}", url, e);
    }
}
