//! Support utilities (spec §4.8, component C8): small, independently
//! testable primitives shared by the protocol front-end and the cache
//! backend rather than owned by either.

pub mod clonable;
pub mod coalesce;
pub mod compress;
pub mod delim;
pub mod joined_writer;
pub mod pool;

pub use clonable::ClonableBytes;
pub use coalesce::FirstSuccess;
pub use pool::BoundedPool;
