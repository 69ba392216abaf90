//! Storage engines behind the [`Store`](crate::application::store::Store)
//! port.

mod memory;
mod postgres;
mod util;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use util::{map_sqlx_error, validate_identifier};
