//! Data models for the content sync backend.
//!
//! Wire types use camelCase; persisted enums round-trip through `as_str`/`from_str`.

mod content;
mod queue;
mod site;
mod snapshot;
mod sync;

pub use content::*;
pub use queue::*;
pub use site::*;
pub use snapshot::*;
pub use sync::*;
