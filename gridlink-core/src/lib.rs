//!
//! # Gridlink Core
//!
//! Gridlink core implements the data layer of a database web client: cached server resources,
//! cancellable long-running tasks and data sources that serialize their requests and saves.
//! Transport and presentation are not part of the crate; the server is reached through the
//! [RemoteCallGateway](crate::gateway::RemoteCallGateway) trait and state changes are published
//! on tokio channels.
//!
//! ## Glossary
//!
//! **[Task](crate::task::Task)** - a unit of asynchronous work spawned as soon as it is created.
//! A task can be cancelled cooperatively by a [CancellationToken](crate::task::CancellationToken).
//! Polling of a server status is done by [while_task](crate::task::while_task), which stops at the
//! next wait boundary after a cancellation.
//!
//! **[Cached data](crate::cache::CachedData)** - a single value loaded from the server on demand.
//! Concurrent loads are merged into a single remote call. A load can ask for optional fields
//! by **[includes](crate::cache::Includes)**; includes requested once are remembered for later loads.
//! Cached data can be *outdated*, which makes the next load fetch again.
//!
//! **Identity key** - a string identifying the entity in a cached value, e.g. the user id.
//! When it changes, subscribers of the identity change channel are notified once.
//!
//! **Exception sink** - a subscriber of loader failures. While one exists, a failed load
//! leaves an empty value in the cache and the failure goes to the sink instead of the caller.
//!
//! **[Resource registry](crate::registry::ResourceRegistry)** - a process-wide table of all cached
//! resources, used for diagnostics. Resources register themselves on construction.
//!
//! **[User info](crate::user_info::UserInfoResource)** - cached data holding the signed-in user;
//! login, logout and user settings go through it.
//!
//! **[Data source](crate::data_source::DataSource)** - client side model of a query: options,
//! slice window, results, diagnostics and an optional **execution context** (a live server session).
//! All requests, saves and tasks of a data source pass through its
//! [mutation serializer](crate::serializer::MutationSerializer), so at most one of them runs at a time.
//!
//! **[Action](crate::results::DataAction)** - an extension object attached to one result of a data
//! source, addressed by an [action kind](crate::results::ActionKind). Actions are registered on the
//! data source and created lazily per result.
extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod auth;
pub mod cache;
pub mod config;
pub mod data_source;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod results;
pub mod serializer;
pub mod task;
pub mod user;
pub mod user_info;

#[cfg(test)]
mod testing;
