//! Authentication and authorisation subsystem.
//!
//! Turns a client's public key into an [`Identity`] during the SSH
//! handshake and decides, per `exec` request, whether the git operation may
//! run.  Every decision is delegated to the pluggable [`Capabilities`].

pub mod authorized_keys;
pub mod handshake;
pub mod identity;
pub mod policy;

pub use handshake::authenticate;
pub use identity::{ConnectionMeta, Identity, SessionContext};
pub use policy::Capabilities;
