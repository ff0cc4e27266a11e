//! Session persistence for Parley.
//!
//! A session is persisted as a single blob holding its metadata, messages
//! and summaries. The [`SessionStore`] trait is the contract; the
//! [`FileSessionStore`] keeps one file per session on local disk.

pub mod file;
pub mod session;

pub use file::FileSessionStore;
pub use session::{
    FORMAT_VERSION, SessionData, SessionMetadata, SessionStore, session_id_for,
    validate_session_id,
};
