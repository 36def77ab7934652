use crate::engine::DecisionEngine;
use crate::protocol::{read_request, AttributeParser, PolicyAction, PolicyRequest, ReadOutcome};
use anyhow::Context;
use std::future::Future;
use std::io::IsTerminal;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Spawn mode when stdin is not a terminal, listener mode otherwise.
    Auto,
    Spawn,
    Listen,
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Mode::Auto),
            "spawn" => Ok(Mode::Spawn),
            "listen" => Ok(Mode::Listen),
            other => anyhow::bail!("unknown mode {other:?} (expected auto, spawn or listen)"),
        }
    }
}

impl Mode {
    pub fn resolve(self) -> Mode {
        match self {
            Mode::Auto if std::io::stdin().is_terminal() => Mode::Listen,
            Mode::Auto => Mode::Spawn,
            explicit => explicit,
        }
    }
}

/// Run the blocking decision off the async workers. A panicked decision
/// fails open.
pub async fn decide(engine: &Arc<DecisionEngine>, request: PolicyRequest) -> PolicyAction {
    let engine = engine.clone();
    match tokio::task::spawn_blocking(move || engine.evaluate(&request)).await {
        Ok(decision) => decision.action(),
        Err(e) => {
            log::error!("Decision task failed, answering DUNNO: {e}");
            PolicyAction::Dunno
        }
    }
}

/// Serve request blocks on one stream until the peer closes. Returns the
/// number of responses written.
pub async fn serve_connection<S>(stream: S, engine: Arc<DecisionEngine>) -> std::io::Result<usize>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut parser = AttributeParser::new();
    let mut served = 0;

    loop {
        match read_request(&mut reader, &mut parser).await? {
            ReadOutcome::Request(request) => {
                let action = decide(&engine, request).await;
                writer.write_all(action.to_response().as_bytes()).await?;
                writer.flush().await?;
                served += 1;
            }
            ReadOutcome::Truncated(partial) => {
                log::debug!("Peer closed mid-request, discarding {} attributes", partial.len());
                return Ok(served);
            }
            ReadOutcome::Closed => return Ok(served),
        }
    }
}

/// Spawn mode: one block in, one response out. A block cut short by end of
/// input is still answered.
pub async fn serve_once<R, W>(reader: R, mut writer: W, engine: Arc<DecisionEngine>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut parser = AttributeParser::new();
    let request = match read_request(&mut reader, &mut parser).await? {
        ReadOutcome::Request(request) | ReadOutcome::Truncated(request) => request,
        ReadOutcome::Closed => PolicyRequest::default(),
    };

    let action = decide(&engine, request).await;
    writer.write_all(action.to_response().as_bytes()).await?;
    writer.flush().await
}

pub struct PolicyServer {
    engine: Arc<DecisionEngine>,
    socket_path: PathBuf,
    socket_mode: u32,
}

impl PolicyServer {
    pub fn new(engine: Arc<DecisionEngine>, socket_path: impl Into<PathBuf>, socket_mode: u32) -> Self {
        Self {
            engine,
            socket_path: socket_path.into(),
            socket_mode,
        }
    }

    /// Replace any stale socket file, bind, and open up permissions.
    pub fn bind(&self) -> anyhow::Result<UnixListener> {
        let path = &self.socket_path;
        if path.symlink_metadata().is_ok() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind policy socket {}", path.display()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(self.socket_mode))
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves, serving each on its own task.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let listener = self.bind()?;
        log::info!(
            "Policy service listening on {} (mode {:o})",
            self.socket_path.display(),
            self.socket_mode
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, closing {}", self.socket_path.display());
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    let engine = self.engine.clone();
                    tokio::spawn(async move {
                        match serve_connection(stream, engine).await {
                            Ok(served) => log::debug!("Connection closed after {served} requests"),
                            Err(e) => log::debug!("Connection dropped: {e}"),
                        }
                    });
                }
            }
        }

        remove_socket(&self.socket_path);
        Ok(())
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("Failed to remove socket {}: {e}", path.display());
    }
}
