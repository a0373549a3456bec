//! GoCICa: a content-addressed two-tier (local disk + remote) build
//! cache daemon that speaks a line-delimited stdio protocol to a
//! toolchain (spec §1). `main.rs` is a thin CLI wrapper around the
//! pieces declared here.

pub mod cache;
pub mod config;
pub mod model;
pub mod pb;
pub mod protocol;
pub mod remote;
pub mod util;
