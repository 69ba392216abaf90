//! Model metadata: the base record, schemas, naming and the `Model` trait.

pub mod base;
pub mod error;
pub mod model;
pub mod naming;
pub mod schema;

pub use base::Base;
pub use error::DomainError;
pub use model::Model;
pub use schema::{Field, FieldKind, Relation, Schema};
