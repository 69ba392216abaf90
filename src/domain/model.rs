//! The trait every resource type implements.

use std::any::type_name;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::application::context::Context;

use super::base::Base;
use super::error::DomainError;
use super::naming;
use super::schema::Schema;

/// A resource persisted and served by the generic pipeline.
///
/// Implementors embed [`Base`] with `#[serde(flatten)]`, describe their
/// columns through [`Model::schema`] and may override any of the ten hooks.
/// Hooks run unless the caller opts out with `without_hook()`; a failing
/// before-hook aborts the operation with no side effects.
///
/// ```ignore
/// #[derive(Clone, Default, Serialize, Deserialize)]
/// struct Tag {
///     #[serde(flatten)]
///     base: Base,
///     label: String,
/// }
///
/// impl Model for Tag {
///     fn base(&self) -> &Base { &self.base }
///     fn base_mut(&mut self) -> &mut Base { &mut self.base }
///     fn schema() -> &'static Schema {
///         static SCHEMA: Lazy<Schema> =
///             Lazy::new(|| Schema::new().field(Field::string("label").filterable()));
///         &SCHEMA
///     }
/// }
/// ```
#[async_trait]
pub trait Model: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {
    fn base(&self) -> &Base;

    fn base_mut(&mut self) -> &mut Base;

    fn schema() -> &'static Schema;

    /// Declared table override, else the pluralized snake_case type name.
    fn table_name() -> String {
        match Self::schema().table {
            Some(table) => table.to_string(),
            None => naming::table_name_for(type_name::<Self>()),
        }
    }

    fn id(&self) -> &str {
        &self.base().id
    }

    async fn create_before(&mut self, _ctx: &Context) -> Result<(), DomainError> {
        Ok(())
    }

    async fn create_after(&self, _ctx: &Context) -> Result<(), DomainError> {
        Ok(())
    }

    async fn update_before(&mut self, _ctx: &Context) -> Result<(), DomainError> {
        Ok(())
    }

    async fn update_after(&self, _ctx: &Context) -> Result<(), DomainError> {
        Ok(())
    }

    async fn delete_before(&self, _ctx: &Context) -> Result<(), DomainError> {
        Ok(())
    }

    async fn delete_after(&self, _ctx: &Context) -> Result<(), DomainError> {
        Ok(())
    }

    async fn list_before(_ctx: &Context) -> Result<(), DomainError> {
        Ok(())
    }

    async fn list_after(_ctx: &Context, _items: &mut Vec<Self>) -> Result<(), DomainError> {
        Ok(())
    }

    async fn get_before(_ctx: &Context, _id: &str) -> Result<(), DomainError> {
        Ok(())
    }

    async fn get_after(&mut self, _ctx: &Context) -> Result<(), DomainError> {
        Ok(())
    }
}
