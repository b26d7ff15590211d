//! Client-side session management for broadcast rooms: signaling channel,
//! identity, the direct peer mesh, and the join-code challenge.
//!
//! [`SessionClient::spawn`] starts a coordinator task over three seams: a
//! [`transport::SignalConnector`] for the signaling channel, a
//! [`transport::DirectProvider`] for peer-to-peer connections, and a
//! [`cache::SessionCache`] for session persistence.

pub mod cache;
pub mod client;
pub mod error;
pub mod mesh;
pub mod reconnect;
pub mod state;
pub mod transport;

pub use cache::{MemoryCache, SessionCache};
pub use client::{JoinOptions, SessionClient, SessionEvent};
pub use error::PeerError;
pub use state::{SessionState, StateEvent};
