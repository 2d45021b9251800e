//! Client library for the update controller

pub mod ipc_client;
pub mod session;

pub use ipc_client::{send_chunk, IpcClient, NotifyStream};
pub use session::{
    CompletionHandler, NotifyHandler, SessionClient, SessionHandle, SessionId, SessionState,
    WriteSupplier,
};
