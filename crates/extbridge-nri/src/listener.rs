//! External plugin listener.
//!
//! Plugins that are not launched by the runtime connect to a well-known Unix
//! socket.  [`ExternalListener`] owns that socket: it clears a stale socket
//! file, creates the parent directory with owner-only permissions, binds,
//! restricts the socket to its owner, and hands every accepted stream to an
//! [`ExternalConnectHandler`] on its own task.

use std::fs::{self, DirBuilder, Permissions};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{NriError, Result};

const SOCKET_DIR_MODE: u32 = 0o700;
const SOCKET_MODE: u32 = 0o600;

/// Receives each externally connected plugin stream.
#[async_trait]
pub trait ExternalConnectHandler: Send + Sync + 'static {
    /// Take ownership of `stream`.  On `Err` the stream has been dropped and
    /// the plugin sees the connection close.
    async fn on_connect(&self, stream: UnixStream) -> Result<()>;
}

/// A running accept loop on a plugin socket.
pub struct ExternalListener {
    path: PathBuf,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ExternalListener {
    /// Bind `socket_path` and start accepting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(socket_path: impl AsRef<Path>, handler: Arc<dyn ExternalConnectHandler>) -> Result<Self> {
        let path = socket_path.as_ref().to_path_buf();

        remove_stale_socket(&path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .mode(SOCKET_DIR_MODE)
                .create(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, Permissions::from_mode(SOCKET_MODE))?;

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, handler, stop_rx, path.clone()));

        tracing::info!(socket = %path.display(), "external plugin listener started");
        Ok(Self {
            path,
            stop: Some(stop),
            task: Some(task),
        })
    }

    /// The socket this listener is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting, wait for the loop to exit and remove the socket file.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let _ = fs::remove_file(&self.path);
        tracing::info!(socket = %self.path.display(), "external plugin listener stopped");
    }
}

impl Drop for ExternalListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    handler: Arc<dyn ExternalConnectHandler>,
    mut stop: oneshot::Receiver<()>,
    path: PathBuf,
) {
    loop {
        let accepted = tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _addr)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.on_connect(stream).await {
                        tracing::warn!(error = %e, "external plugin connection refused");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(socket = %path.display(), error = %e, "accept failed");
                // Transient (e.g. descriptor exhaustion); back off briefly.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Remove a leftover socket file; refuse to touch anything else.
fn remove_stale_socket(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path)?;
            tracing::debug!(socket = %path.display(), "stale socket removed");
            Ok(())
        }
        Ok(_) => Err(NriError::InvalidArgument(format!(
            "{} exists and is not a socket",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
