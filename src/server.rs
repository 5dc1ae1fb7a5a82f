use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Context as _;
use hyper::{Method, Request, Response, StatusCode, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    api::{self, ApiState},
    config::Config,
    grouping,
    proxy::{Proxy, ProxyBody, simple_response},
    recorder::{GroupSink, Recorder},
};

/// Running server: the proxy surface, the read API, and the recorder
/// pipeline behind them.
pub struct ServerHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    recorder: Arc<Recorder>,
}

impl ServerHandle {
    /// Stops accepting connections, then drains and flushes the recorder.
    /// Returns an error only if the final index flush fails.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
        self.recorder.close().await
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<ServerHandle> {
    let groups = config
        .recording
        .enabled
        .then(|| Arc::new(grouping::Manager::new(&config.recording.path)));
    if groups.is_some() {
        tracing::info!("grouping enabled");
    }

    let group_sink = groups
        .clone()
        .map(|manager| manager as Arc<dyn GroupSink>);
    let recorder = Arc::new(Recorder::new(
        config.recording.enabled,
        config.recording.path.clone(),
        group_sink,
    )?);

    let proxy = Arc::new(Proxy::new(config, Arc::clone(&recorder))?);
    let api_state = Arc::new(ApiState {
        recordings_path: config.recording.path.clone(),
        index: recorder.index(),
        groups,
    });

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    let listen_addr = listener.local_addr().context("get local_addr")?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let proxy = Arc::clone(&proxy);
                    let api_state = Arc::clone(&api_state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            route(req, Arc::clone(&proxy), Arc::clone(&api_state))
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    tracing::info!(port = listen_addr.port(), "mirra started");

    Ok(ServerHandle {
        listen_addr,
        shutdown_tx,
        join,
        recorder,
    })
}

async fn route(
    req: Request<Incoming>,
    proxy: Arc<Proxy>,
    api_state: Arc<ApiState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let response = if method == Method::GET && path == "/health" {
        simple_response(StatusCode::OK, "OK")
    } else if is_api_path(&path) {
        api::handle(req, api_state).await
    } else {
        proxy.handle(req).await
    };

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms,
        "request",
    );

    Ok(response)
}

fn is_api_path(path: &str) -> bool {
    path == "/api/recordings"
        || path.starts_with("/api/recordings/")
        || path == "/api/groups/sessions"
        || path.starts_with("/api/groups/sessions/")
}
