//! The remote tier (spec §4.4, §4.5, §4.9 — components C4, C5, C9): a
//! single content-addressed RemoteBundle object per cache key, fetched
//! and rebuilt incrementally against a pluggable provider.

pub mod bundle;
pub mod provider;
pub mod sigv4;
pub mod transfer;

pub use bundle::{BundleError, BundleHeader, Compression, OutputRecord};
pub use provider::{
    cache_keys, version_tag, DownloadClient, ProviderError, RemoteProvider, UploadClient,
    DEFAULT_DOMAIN_TAG,
};
pub use transfer::{Downloader, TransferError, Uploader};
