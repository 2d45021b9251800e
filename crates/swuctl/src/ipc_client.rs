//! IPC Client - Unix socket client for the update controller
//!
//! One-shot commands open a fresh control connection, send one frame and read
//! one reply. Install sessions keep the control connection for the image
//! stream and add a progress connection for notifications.

use std::path::{Path, PathBuf};

use swu_common::config::IpcConfig;
use swu_common::error::IoContext;
use swu_common::ipc::{self, InstallRequest, Message, Notification, StatusReport};
use swu_common::{SwuError, SwuResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// Largest reply frame accepted
const MAX_FRAME: usize = 64 * 1024;

/// Connection factory and one-shot commands
#[derive(Debug, Clone)]
pub struct IpcClient {
    control_socket: PathBuf,
    progress_socket: PathBuf,
}

impl IpcClient {
    pub fn new(config: &IpcConfig) -> Self {
        Self {
            control_socket: config.control_socket.clone(),
            progress_socket: config.progress_socket.clone(),
        }
    }

    pub fn control_socket(&self) -> &Path {
        &self.control_socket
    }

    /// Open a new control connection
    pub async fn connect_control(&self) -> SwuResult<UnixStream> {
        connect(&self.control_socket).await
    }

    /// Open the notification channel
    pub async fn connect_progress(&self) -> SwuResult<NotifyStream> {
        let mut stream = connect(&self.progress_socket).await?;
        write_frame(&mut stream, &Message::NotifyStream).await?;
        Ok(NotifyStream::new(stream))
    }

    /// Send one command and return the controller's reply
    pub async fn send_command(&self, message: &Message) -> SwuResult<Message> {
        let mut stream = self.connect_control().await?;
        write_frame(&mut stream, message).await?;
        let reply = read_frame(&mut stream).await?;
        debug!("{} -> {}", message.name(), reply.name());
        Ok(reply)
    }

    /// Send a command that must be acknowledged
    async fn send_acked(&self, message: &Message) -> SwuResult<()> {
        match self.send_command(message).await? {
            Message::Ack => Ok(()),
            Message::Nack { reason } => Err(SwuError::Protocol(format!(
                "controller rejected {}: {}",
                message.name(),
                reason
            ))),
            other => Err(unexpected(message, &other)),
        }
    }

    /// Set the image decryption key, both values as ASCII hex
    pub async fn set_aes_key(&self, key: &str, ivt: &str) -> SwuResult<()> {
        self.send_acked(&Message::aes_key(key, ivt)?).await
    }

    /// Set the accepted version window
    pub async fn set_version_range(
        &self,
        minimum: Option<&str>,
        maximum: Option<&str>,
        current: Option<&str>,
    ) -> SwuResult<()> {
        self.send_acked(&Message::versions_range(minimum, maximum, current))
            .await
    }

    /// Ask the controller to run its post-update actions
    pub async fn post_update(&self) -> SwuResult<()> {
        self.send_acked(&Message::PostUpdate).await
    }

    pub async fn get_status(&self) -> SwuResult<StatusReport> {
        let request = Message::GetStatus;
        match self.send_command(&request).await? {
            Message::Status(report) => Ok(report),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Start an install. The returned connection takes the image bytes.
    pub async fn start_install(&self, request: &InstallRequest) -> SwuResult<UnixStream> {
        let message = Message::ReqInstall(request.clone());
        let mut stream = self.connect_control().await?;
        write_frame(&mut stream, &message).await?;
        match read_frame(&mut stream).await? {
            Message::Ack => Ok(stream),
            Message::Nack { reason } => Err(SwuError::Protocol(format!(
                "controller refused install: {}",
                reason
            ))),
            other => Err(unexpected(&message, &other)),
        }
    }
}

/// Write one raw image chunk on a connection from `start_install`
pub async fn send_chunk(conn: &mut UnixStream, data: &[u8]) -> SwuResult<()> {
    conn.write_all(data)
        .await
        .io_context("Could not send image data")
}

fn unexpected(request: &Message, reply: &Message) -> SwuError {
    SwuError::Protocol(format!(
        "unexpected {} reply to {}",
        reply.name(),
        request.name()
    ))
}

async fn connect(path: &Path) -> SwuResult<UnixStream> {
    UnixStream::connect(path)
        .await
        .io_context(format!("Could not connect to {}", path.display()))
}

pub(crate) async fn write_frame(stream: &mut UnixStream, message: &Message) -> SwuResult<()> {
    let bytes = ipc::encode(message)?;
    stream
        .write_all(&bytes)
        .await
        .io_context(format!("Could not send {}", message.name()))
}

/// Read exactly one reply frame. Anything after it is a protocol error, the
/// controller sends nothing else on a connection until we speak again.
pub(crate) async fn read_frame(stream: &mut UnixStream) -> SwuResult<Message> {
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .io_context("Could not read controller reply")?;
        if n == 0 {
            return Err(SwuError::Protocol(
                "controller closed the connection without replying".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            if pos + 1 != buf.len() {
                return Err(SwuError::Protocol(
                    "unexpected data after controller reply".to_string(),
                ));
            }
            return ipc::decode(&buf[..pos]);
        }
        if buf.len() > MAX_FRAME {
            return Err(SwuError::Protocol("controller reply too large".to_string()));
        }
    }
}

/// Progress channel: a stream of `Notify` frames
pub struct NotifyStream {
    stream: UnixStream,
    buf: Vec<u8>,
    closed: bool,
}

impl NotifyStream {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            closed: false,
        }
    }

    /// Wait until the channel has data (or was closed)
    pub async fn readable(&self) -> SwuResult<()> {
        if self.closed || self.has_frame() {
            return Ok(());
        }
        self.stream
            .readable()
            .await
            .io_context("Could not wait on notification channel")
    }

    /// Every notification available right now, without waiting
    pub fn drain_available(&mut self) -> SwuResult<Vec<Notification>> {
        self.fill_nonblocking()?;
        let mut out = Vec::new();
        while let Some(notification) = self.next_buffered()? {
            out.push(notification);
        }
        if out.is_empty() && self.closed {
            return Err(self.closed_error());
        }
        Ok(out)
    }

    /// Wait for the next notification
    pub async fn recv(&mut self) -> SwuResult<Notification> {
        loop {
            if let Some(notification) = self.next_buffered()? {
                return Ok(notification);
            }
            if self.closed {
                return Err(self.closed_error());
            }
            self.stream
                .readable()
                .await
                .io_context("Could not wait on notification channel")?;
            self.fill_nonblocking()?;
        }
    }

    fn fill_nonblocking(&mut self) -> SwuResult<()> {
        let mut chunk = [0u8; 4096];
        while !self.closed {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => self.closed = true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SwuError::io("ipc_notify receive failed", e)),
            }
            if self.buf.len() > MAX_FRAME && !self.has_frame() {
                return Err(SwuError::Protocol("notification too large".to_string()));
            }
        }
        Ok(())
    }

    fn has_frame(&self) -> bool {
        self.buf.contains(&b'\n')
    }

    fn next_buffered(&mut self) -> SwuResult<Option<Notification>> {
        let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        match ipc::decode(&line)? {
            Message::Notify(notification) => Ok(Some(notification)),
            other => Err(SwuError::Protocol(format!(
                "unexpected {} on notification channel",
                other.name()
            ))),
        }
    }

    fn closed_error(&self) -> SwuError {
        SwuError::io(
            "ipc_notify receive failed",
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "controller closed the notification channel",
            ),
        )
    }
}
