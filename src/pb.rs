//! Generated protobuf types for the persisted local index (spec §4.3) and
//! the RemoteBundle header (spec §3, §4.4), compiled by `build.rs` via
//! `prost-build` from `proto/bundle.proto`.

include!(concat!(env!("OUT_DIR"), "/gocica.bundle.v1.rs"));
