//! Replication services: central fan-out, subsite apply, approval, bulk and media.

mod apply;
mod approval;
mod bulk;
mod central;
mod media;
mod transport;

pub use apply::*;
pub use approval::*;
pub use bulk::*;
pub use central::*;
pub use media::*;
pub use transport::*;
