//! Sessions: orchestration, routing, event classification, locking.

pub mod events;
pub mod locks;
pub mod node;
pub mod router;
pub mod service;

pub use node::{FileContent, FileListing, FileSource, HostError, LocalHost, SandboxHost};
pub use router::HostRouter;
pub use service::{
    CreateSessionOptions, MessageStream, OutboundEvent, ServiceError, SessionService,
};
