//! Demo resources served by the `trellis` binary: users and their groups.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::application::{Context, Error, ListQuery, ModelRegistry, Service};
use crate::domain::{Base, DomainError, Field, Model, Relation, Schema};
use crate::infra::http::{CrudRouter, HttpState, Payload, Verbs};

/// Id of the built-in group; hidden from group listings.
pub const ROOT_GROUP_ID: &str = "root";
/// Actor allowed to list soft-deleted users.
pub const ADMIN_ACTOR: &str = "admin";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<User>,
}

impl Model for Group {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn schema() -> &'static Schema {
        static SCHEMA: Lazy<Schema> = Lazy::new(|| {
            Schema::new()
                .field(Field::string("name").filterable().unique())
                .relation(Relation::has_many("users", "users", "group_id"))
                .exclude("id", &[ROOT_GROUP_ID])
        });
        &SCHEMA
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub age: u32,
    #[serde(default)]
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Box<Group>>,
}

#[async_trait]
impl Model for User {
    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn schema() -> &'static Schema {
        static SCHEMA: Lazy<Schema> = Lazy::new(|| {
            Schema::new()
                .field(Field::string("name").filterable())
                .field(Field::string("email").optional().filterable().unique())
                .field(Field::int("age").filterable())
                .field(Field::string("group_id").filterable())
                .relation(Relation::belongs_to("group", "groups", "group_id"))
        });
        &SCHEMA
    }

    async fn create_before(&mut self, _ctx: &Context) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("user name must not be empty"));
        }
        if let Some(email) = &self.email
            && !email.contains('@')
        {
            return Err(DomainError::validation(format!(
                "`{email}` is not an email address"
            )));
        }
        Ok(())
    }
}

/// Body accepted by the user endpoints; normalizes before storing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub age: u32,
    #[serde(default)]
    pub group_id: String,
}

impl Payload<User> for UserRequest {
    fn into_model(self) -> User {
        User {
            base: Base::with_id(self.id),
            name: self.name.trim().to_string(),
            email: self.email.map(|email| email.trim().to_ascii_lowercase()),
            age: self.age,
            group_id: self.group_id,
            group: None,
        }
    }
}

/// Restricts soft-deleted listings to the admin actor.
pub struct UserService;

#[async_trait]
impl Service<User> for UserService {
    async fn list_before(&self, ctx: &Context, query: &mut ListQuery) -> Result<(), Error> {
        if query.show_deleted && ctx.actor() != Some(ADMIN_ACTOR) {
            return Err(Error::bad_request(
                "_show_deleted requires the admin actor",
            ));
        }
        Ok(())
    }
}

pub fn root_group() -> Group {
    Group {
        base: Base::with_id(ROOT_GROUP_ID),
        name: "root".to_string(),
        users: Vec::new(),
    }
}

/// Registry with both demo models, the root group seed and the user service.
pub fn registry() -> Result<Arc<ModelRegistry>, Error> {
    ModelRegistry::builder()
        .register_seeded::<Group>(vec![root_group()])
        .register::<User>()
        .with_service::<User>(UserService)
        .build()
}

pub fn router(state: HttpState) -> Router {
    CrudRouter::new()
        .resource_with::<User, UserRequest, User>("/user", Verbs::ALL)
        .resource::<Group>("/group")
        .build(state)
}
