//! Generic CRUD scaffolding for axum services.
//!
//! Declare a [`Model`](domain::Model), register it in a
//! [`ModelRegistry`](application::ModelRegistry) and mount it with
//! [`CrudRouter`](infra::http::CrudRouter): the crate provides the list,
//! get, write and batch endpoints, the hookable [`Database`](application::Database)
//! layer behind them and a typed read cache.

pub mod application;
pub mod cache;
pub mod config;
pub mod demo;
pub mod domain;
pub mod infra;

pub use application::{Context, Database, Db, Error, ErrorKind, ModelRegistry, Service};
pub use domain::{Base, Field, FieldKind, Model, Relation, Schema};
pub use infra::http::{CrudRouter, HttpState, Payload, Verbs};
