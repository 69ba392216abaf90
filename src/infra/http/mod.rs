//! HTTP surface: generic CRUD controller, router, envelope and middleware.

pub mod controller;
mod envelope;
mod error;
pub mod middleware;
mod router;
mod state;

pub use controller::{Payload, Render};
pub use error::ApiError;
pub use middleware::{ACTOR_HEADER, REQUEST_ID_HEADER};
pub use router::{CrudRouter, Verbs};
pub use state::HttpState;
