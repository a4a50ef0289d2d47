//! Peer synchronization: remotes, channels, mailboxes and batch tracking.

pub mod channel;
pub mod mailbox;
pub mod manager;
pub mod sync_operation;

pub use channel::{
    Channel, ChannelConfig, ChannelFactory, ChannelMeta, Envelope, InternalChannel, InternalHub,
};
pub use mailbox::{Mailbox, MailboxCallbackId};
pub use manager::{
    OperationLoader, Remote, RemoteFilter, RemoteStatus, SyncHealth, SyncManager,
};
pub use sync_operation::{SyncDirection, SyncOperation, SyncOperationStatus};
