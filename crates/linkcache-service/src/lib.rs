//! Typed content links and the loading cache that resolves them.
//!
//! A [`Link`](links::Link) names a piece of content by its address. The
//! [`LoadingCache`](caching::LoadingCache) resolves addresses through a
//! [`Backend`](backend::Backend), either one at a time or a whole group at once, and keeps the
//! loaded content in memory until the group is released.

#[macro_use]
pub mod metrics;

pub mod backend;
pub mod caching;
pub mod config;
pub mod links;
pub mod logging;
pub mod utils;
