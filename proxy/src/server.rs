//! Listener and shared server state
//!
//! One [`ServerContext`] is shared by every connection. Each accepted socket
//! gets a reader task, a writer task and a [`Tunnel`] that handles its
//! requests in order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ConfigHandle;
use crate::http::{read_loop, ConnectionWriter, INBOUND_QUEUE};
use crate::llm::LlmClient;
use crate::mcp::{discover, McpServer, SessionHandle, SessionTable, ToolInvoker, ToolRegistry, ToolRunner, TunnelId};
use crate::tunnel::{ModelCatalog, Tunnel};

pub struct ServerContext {
    pub config: ConfigHandle,
    pub llm: LlmClient,
    pub registry: Arc<ToolRegistry>,
    pub invoker: Arc<dyn ToolInvoker>,
    pub sessions: SessionHandle,
    pub mcp: McpServer,
    pub models: ModelCatalog,
    next_tunnel: AtomicU64,
}

impl ServerContext {
    /// Build the shared state. Must be called inside a tokio runtime, the
    /// session table runs as its own task.
    pub fn new(config: ConfigHandle, invoker: Arc<dyn ToolInvoker>) -> Arc<Self> {
        let registry = Arc::new(ToolRegistry::new());
        let sessions = SessionTable::spawn(registry.subscribe());
        let mcp = McpServer::new(registry.clone(), invoker.clone());
        Arc::new(Self {
            config,
            llm: LlmClient::new(),
            registry,
            invoker,
            sessions,
            mcp,
            models: ModelCatalog::new(),
            next_tunnel: AtomicU64::new(1),
        })
    }

    pub fn next_tunnel_id(&self) -> TunnelId {
        self.next_tunnel.fetch_add(1, Ordering::Relaxed)
    }
}

/// Drive one connection until either side closes it or `cancel` fires
pub async fn serve_connection<S>(ctx: Arc<ServerContext>, stream: S, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (writer, writer_task) = ConnectionWriter::spawn(write_half, cancel.clone());
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let reader_task = tokio::spawn(read_loop(read_half, tx, cancel.clone()));

    let tunnel = Tunnel::new(ctx.next_tunnel_id(), ctx, writer);
    tunnel.run(rx).await;

    let _ = reader_task.await;
    let _ = writer_task.await;
}

/// Accept connections on `listener` until `shutdown` fires
pub async fn run(ctx: Arc<ServerContext>, listener: TcpListener, shutdown: CancellationToken) {
    let mut conn_id: u64 = 0;
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    continue;
                }
            },
        };
        conn_id += 1;
        let _ = stream.set_nodelay(true);

        let span = tracing::info_span!("conn", id = conn_id, peer = %peer);
        let ctx = ctx.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(
            async move {
                tracing::debug!("accepted");
                serve_connection(ctx, stream, cancel).await;
                tracing::debug!("closed");
            }
            .instrument(span),
        );
    }
    tracing::info!("listener stopped");
}

/// Load tools, bind the configured address and serve until Ctrl-C.
///
/// On unix, SIGHUP reloads the config file and rediscovers tools.
pub async fn serve(config: ConfigHandle) -> anyhow::Result<()> {
    let runner = ToolRunner::new(config.clone());
    let ctx = ServerContext::new(config.clone(), Arc::new(runner.clone()));

    let snapshot = config.current();
    let servers: Vec<String> = snapshot.mcp_servers.keys().cloned().collect();
    let tools = discover(&runner, &ctx.registry, &servers).await;
    tracing::info!(servers = servers.len(), tools, "tool discovery finished");

    let addr: SocketAddr = format!("{}:{}", snapshot.server.host, snapshot.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                snapshot.server.host, snapshot.server.port
            )
        })?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("listening on http://{}", addr);

    let shutdown = CancellationToken::new();
    spawn_reload(ctx.clone(), runner, shutdown.clone())?;

    let accept = tokio::spawn(run(ctx, listener, shutdown.clone()));
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");
    shutdown.cancel();
    let _ = accept.await;
    Ok(())
}

#[cfg(unix)]
fn spawn_reload(
    ctx: Arc<ServerContext>,
    runner: ToolRunner,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            match ctx.config.reload() {
                Ok(config) => {
                    let servers: Vec<String> = config.mcp_servers.keys().cloned().collect();
                    let tools = discover(&runner, &ctx.registry, &servers).await;
                    tracing::info!(tools, "config reloaded");
                }
                Err(e) => tracing::warn!("config reload failed, keeping previous: {}", e),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload(
    _ctx: Arc<ServerContext>,
    _runner: ToolRunner,
    _shutdown: CancellationToken,
) -> anyhow::Result<()> {
    Ok(())
}
