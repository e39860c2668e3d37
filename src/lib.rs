//! onionbox - a session-jailed file box served over HTTP.
//!
//! Clients browse, upload, download, delete and create directories under a
//! single root. Each client holds only an opaque session cookie; the server
//! remembers that session's current directory and keeps it inside the root.

pub mod config;
pub mod confine;
pub mod error;
pub mod fs_ops;
pub mod http_server;
pub mod navigate;
pub mod session;
pub mod state;

pub use config::Config;
pub use confine::{is_within_root, Jail};
pub use error::{FsError, FsResult};
pub use http_server::{router, run_server, SESSION_COOKIE};
pub use session::{ResolvedSession, SessionStore};
pub use state::AppState;
