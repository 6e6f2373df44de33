//! Storage layer: one row abstraction over an embedded SQLite pool and a
//! remote libSQL HTTP service, a retrying [`Store`] facade, and typed
//! accessors for every table the pipeline touches.

pub mod backend;
pub mod briefs;
pub mod candles;
pub mod db;
pub mod error;
pub mod http;
pub mod meta;
pub mod models;
pub mod notifications;
pub mod predictions;
pub mod tasks;
pub mod traces;
pub mod users;
pub mod value;

pub use backend::{SqlBackend, SqlxBackend};
pub use db::{Store, MAX_BATCH_ROWS};
pub use error::{StoreError, StoreResult};
pub use http::HttpSqlBackend;
pub use notifications::NotificationLogEntry;
pub use predictions::PrimaryHolder;
pub use tasks::TaskLogRow;
pub use users::PushSubscription;
pub use value::{QueryResult, Row, Value};
