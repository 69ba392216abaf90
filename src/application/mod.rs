//! Model-agnostic CRUD pipeline: query decoding, hooks, the generic
//! database layer and the storage port it drives.

pub mod context;
pub mod cursor;
pub mod database;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod query;
pub mod registry;
pub mod store;

pub use context::Context;
pub use database::{Database, Db, DbBuilder, ListPage, Tx};
pub use error::{Error, ErrorKind};
pub use hooks::{NoopService, Phase, Service};
pub use query::ListQuery;
pub use registry::{ModelRegistry, ModelRegistryBuilder};
