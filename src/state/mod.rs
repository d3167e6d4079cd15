//! Durable session/result/api-key state (Postgres)

mod error;
mod models;
mod store;

pub use error::{Result, StateError};
pub use models::{
    uuid_simple, ApiKeyRecord, JobKind, ProjectCount, ResultRow, Session, SessionFilter,
    SessionStatus,
};
pub use store::{hash_key, StateStore};
