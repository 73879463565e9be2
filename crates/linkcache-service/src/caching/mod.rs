//! The loading cache and the content it holds.

mod cache_error;
mod content;
mod loading;

pub use cache_error::*;
pub use content::*;
pub(crate) use content::type_mismatch;
pub use loading::*;

#[cfg(test)]
mod tests;
