//! # GraphQL Resolvers Module
//!
//! Query, Mutation, and Subscription resolvers.

pub mod mutation;
pub mod query;
pub mod subscription;

pub use mutation::MutationRoot;
pub use query::QueryRoot;
pub use subscription::SubscriptionRoot;

use async_graphql::{ID, ResultExt};
use uuid::Uuid;

use crate::error::ApiError;

/// Alert ids are UUIDs; anything else is a client error
fn parse_uuid(id: &ID) -> async_graphql::Result<Uuid> {
    Uuid::parse_str(id).map_err(ApiError::from).extend()
}
