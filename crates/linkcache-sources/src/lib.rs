//! Plain data types shared by every part of linkcache.
//!
//! Includes content addresses and group keys, the catalog that backends resolve
//! addresses with, and the configuration describing where content is loaded from.

#![warn(missing_docs)]

mod catalog;
mod sources;
mod types;

pub use catalog::*;
pub use sources::*;
pub use types::*;
