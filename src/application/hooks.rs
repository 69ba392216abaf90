//! Per-model service hooks invoked by the HTTP controller.

use async_trait::async_trait;

use crate::domain::Model;

use super::context::Context;
use super::database::ListPage;
use super::error::Error;
use super::query::ListQuery;

/// Controller phase a service hook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    CreateBefore,
    CreateAfter,
    DeleteBefore,
    DeleteAfter,
    UpdateBefore,
    UpdateAfter,
    UpdatePartialBefore,
    UpdatePartialAfter,
    ListBefore,
    ListAfter,
    GetBefore,
    GetAfter,
    BatchCreateBefore,
    BatchCreateAfter,
    BatchDeleteBefore,
    BatchDeleteAfter,
    BatchUpdateBefore,
    BatchUpdateAfter,
    BatchUpdatePartialBefore,
    BatchUpdatePartialAfter,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::CreateBefore => "create_before",
            Phase::CreateAfter => "create_after",
            Phase::DeleteBefore => "delete_before",
            Phase::DeleteAfter => "delete_after",
            Phase::UpdateBefore => "update_before",
            Phase::UpdateAfter => "update_after",
            Phase::UpdatePartialBefore => "update_partial_before",
            Phase::UpdatePartialAfter => "update_partial_after",
            Phase::ListBefore => "list_before",
            Phase::ListAfter => "list_after",
            Phase::GetBefore => "get_before",
            Phase::GetAfter => "get_after",
            Phase::BatchCreateBefore => "batch_create_before",
            Phase::BatchCreateAfter => "batch_create_after",
            Phase::BatchDeleteBefore => "batch_delete_before",
            Phase::BatchDeleteAfter => "batch_delete_after",
            Phase::BatchUpdateBefore => "batch_update_before",
            Phase::BatchUpdateAfter => "batch_update_after",
            Phase::BatchUpdatePartialBefore => "batch_update_partial_before",
            Phase::BatchUpdatePartialAfter => "batch_update_partial_after",
        }
    }

    pub fn is_after(&self) -> bool {
        self.as_str().ends_with("_after")
    }
}

/// Interceptors around every controller operation of `M`.
///
/// Every method defaults to a no-op. Before hooks may reject the request;
/// after hooks may fail the response, but the mutation stays durable.
#[async_trait]
#[allow(unused_variables)]
pub trait Service<M: Model>: Send + Sync + 'static {
    /// Adjust an incoming model, e.g. to inject tenant scope. The list
    /// endpoint applies it to an empty model and filters by the result.
    fn filter(&self, ctx: &Context, item: M) -> M {
        item
    }

    /// Raw condition appended with AND to list queries; empty means none.
    fn filter_raw(&self, ctx: &Context) -> String {
        String::new()
    }

    async fn create_before(&self, ctx: &Context, item: &mut M) -> Result<(), Error> {
        Ok(())
    }

    async fn create_after(&self, ctx: &Context, item: &mut M) -> Result<(), Error> {
        Ok(())
    }

    async fn delete_before(&self, ctx: &Context, item: &mut M) -> Result<(), Error> {
        Ok(())
    }

    async fn delete_after(&self, ctx: &Context, item: &mut M) -> Result<(), Error> {
        Ok(())
    }

    async fn update_before(&self, ctx: &Context, item: &mut M) -> Result<(), Error> {
        Ok(())
    }

    async fn update_after(&self, ctx: &Context, item: &mut M) -> Result<(), Error> {
        Ok(())
    }

    async fn update_partial_before(&self, ctx: &Context, item: &mut M) -> Result<(), Error> {
        Ok(())
    }

    async fn update_partial_after(&self, ctx: &Context, item: &mut M) -> Result<(), Error> {
        Ok(())
    }

    async fn list_before(&self, ctx: &Context, query: &mut ListQuery) -> Result<(), Error> {
        Ok(())
    }

    async fn list_after(&self, ctx: &Context, page: &mut ListPage<M>) -> Result<(), Error> {
        Ok(())
    }

    async fn get_before(&self, ctx: &Context, id: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn get_after(&self, ctx: &Context, item: &mut M) -> Result<(), Error> {
        Ok(())
    }

    async fn batch_create_before(&self, ctx: &Context, items: &mut Vec<M>) -> Result<(), Error> {
        Ok(())
    }

    async fn batch_create_after(&self, ctx: &Context, items: &mut Vec<M>) -> Result<(), Error> {
        Ok(())
    }

    async fn batch_delete_before(&self, ctx: &Context, items: &mut Vec<M>) -> Result<(), Error> {
        Ok(())
    }

    async fn batch_delete_after(&self, ctx: &Context, items: &mut Vec<M>) -> Result<(), Error> {
        Ok(())
    }

    async fn batch_update_before(&self, ctx: &Context, items: &mut Vec<M>) -> Result<(), Error> {
        Ok(())
    }

    async fn batch_update_after(&self, ctx: &Context, items: &mut Vec<M>) -> Result<(), Error> {
        Ok(())
    }

    async fn batch_update_partial_before(
        &self,
        ctx: &Context,
        items: &mut Vec<M>,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn batch_update_partial_after(
        &self,
        ctx: &Context,
        items: &mut Vec<M>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Used for models without a registered service.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopService;

impl<M: Model> Service<M> for NoopService {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_know_their_side() {
        assert!(Phase::BatchUpdatePartialAfter.is_after());
        assert!(!Phase::GetBefore.is_after());
        assert_eq!(Phase::UpdatePartialBefore.as_str(), "update_partial_before");
    }
}
