//! Update session client
//!
//! At most one install session per client. `begin` hands the image supplier
//! and callbacks to a background task that streams the image, forwards
//! notifications and reports the final result exactly once.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use swu_common::error::IoContext;
use swu_common::ipc::{InstallRequest, Notification, RecoveryStatus};
use swu_common::{SwuError, SwuResult};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ipc_client::{IpcClient, NotifyStream};

/// Produces the next image chunk. An empty chunk ends the image.
pub type WriteSupplier = Box<dyn FnMut() -> io::Result<Vec<u8>> + Send>;
/// Called for every notification, in arrival order
pub type NotifyHandler = Box<dyn FnMut(&Notification) + Send>;
/// Called once with the final result
pub type CompletionHandler = Box<dyn FnOnce(RecoveryStatus) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    /// Finished, background task not yet reaped
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Returned by a successful `begin`
pub struct SessionHandle {
    id: SessionId,
    done: oneshot::Receiver<RecoveryStatus>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Wait for the session's final result
    pub async fn wait(self) -> RecoveryStatus {
        self.done.await.unwrap_or(RecoveryStatus::Failure)
    }
}

pub struct SessionClient {
    ipc: IpcClient,
    state: Arc<Mutex<SessionState>>,
    worker: Option<JoinHandle<()>>,
    next_id: u64,
}

impl SessionClient {
    pub fn new(ipc: IpcClient) -> Self {
        Self {
            ipc,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            worker: None,
            next_id: 0,
        }
    }

    pub fn ipc(&self) -> &IpcClient {
        &self.ipc
    }

    pub fn state(&self) -> SessionState {
        *lock_state(&self.state)
    }

    /// Start an install session.
    ///
    /// Fails with `Busy` while another session is running. A finished
    /// session is reaped first. When `begin` returns an error none of the
    /// callbacks are invoked.
    pub async fn begin(
        &mut self,
        write: WriteSupplier,
        notify: Option<NotifyHandler>,
        completion: Option<CompletionHandler>,
        request: InstallRequest,
    ) -> SwuResult<SessionHandle> {
        match self.state() {
            SessionState::Running => {
                return Err(SwuError::Busy(
                    "an update session is already running".to_string(),
                ))
            }
            SessionState::Done => self.reap().await,
            SessionState::Idle => {}
        }

        let conn = self.ipc.start_install(&request).await?;

        self.next_id += 1;
        let id = SessionId(self.next_id);
        *lock_state(&self.state) = SessionState::Running;
        info!("Update session {} started", id);

        let (done_tx, done_rx) = oneshot::channel();
        let worker = SessionWorker {
            id,
            ipc: self.ipc.clone(),
            conn,
            write,
            notify,
        };
        let state = Arc::clone(&self.state);
        self.worker = Some(tokio::spawn(async move {
            // caller callbacks run inside the inner task, a panic there
            // still ends the session with Failure
            let status = match tokio::spawn(worker.run()).await {
                Ok(status) => status,
                Err(e) => {
                    error!("Update session {} aborted: {}", id, e);
                    RecoveryStatus::Failure
                }
            };
            if let Some(completion) = completion {
                if panic::catch_unwind(AssertUnwindSafe(|| completion(status))).is_err() {
                    error!("Completion handler of session {} panicked", id);
                }
            }
            *lock_state(&state) = SessionState::Done;
            let _ = done_tx.send(status);
        }));

        Ok(SessionHandle { id, done: done_rx })
    }

    /// Join a finished background task and return to Idle
    async fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("Update session task ended abnormally: {}", e);
            }
        }
        *lock_state(&self.state) = SessionState::Idle;
    }
}

fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Ready {
    Notify,
    Write,
}

struct SessionWorker {
    id: SessionId,
    ipc: IpcClient,
    conn: UnixStream,
    write: WriteSupplier,
    notify: Option<NotifyHandler>,
}

impl SessionWorker {
    async fn run(mut self) -> RecoveryStatus {
        if let Err(e) = self.stream_image().await {
            error!("Update session {} aborted: {}", self.id, e);
            return RecoveryStatus::Failure;
        }
        match self.ipc.get_status().await {
            Ok(report) => {
                info!(
                    "Update session {} finished: {}",
                    self.id,
                    report.last_result.as_str()
                );
                report.last_result
            }
            Err(e) => {
                error!("Could not query final status: {}", e);
                RecoveryStatus::Failure
            }
        }
    }

    /// Stream the image while forwarding notifications, then wait for the
    /// controller to go idle.
    async fn stream_image(&mut self) -> SwuResult<()> {
        let mut progress = self.ipc.connect_progress().await?;
        let mut last = RecoveryStatus::Running;
        let mut pending: Vec<u8> = Vec::new();
        let mut offset = 0;
        let mut end_of_image = false;

        while !(end_of_image && offset == pending.len()) {
            let ready = tokio::select! {
                r = progress.readable() => { r?; Ready::Notify }
                r = self.conn.writable() => {
                    r.io_context("Could not wait on control connection")?;
                    Ready::Write
                }
            };
            if let Ready::Write = ready {
                if offset == pending.len() {
                    let chunk = (self.write)().io_context("Image supplier failed")?;
                    if chunk.is_empty() {
                        end_of_image = true;
                    } else {
                        pending = chunk;
                        offset = 0;
                    }
                }
                if offset < pending.len() {
                    match self.conn.try_write(&pending[offset..]) {
                        Ok(n) => offset += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(SwuError::io("Could not send image data", e)),
                    }
                }
            }
            for notification in progress.drain_available()? {
                last = self.forward(&notification);
            }
        }

        self.conn
            .shutdown()
            .await
            .io_context("Could not close image stream")?;
        debug!("Update session {}: image sent", self.id);

        self.wait_idle(&mut progress, last).await
    }

    async fn wait_idle(
        &mut self,
        progress: &mut NotifyStream,
        mut last: RecoveryStatus,
    ) -> SwuResult<()> {
        while last != RecoveryStatus::Idle {
            let notification = progress.recv().await?;
            last = self.forward(&notification);
        }
        Ok(())
    }

    fn forward(&mut self, notification: &Notification) -> RecoveryStatus {
        debug!(
            "Status: {} message: {}",
            notification.status.as_str(),
            notification.msg
        );
        if let Some(notify) = self.notify.as_mut() {
            notify(notification);
        }
        notification.status
    }
}
