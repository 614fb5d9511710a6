//! Bulkfetch is the download core of the installer: it fetches large sets of
//! assets in parallel over HTTP(S), verifies each file against its declared
//! size and SHA-1, and streams progress back to the caller.

#![deny(unsafe_op_in_unsafe_fn)]

mod http;
mod tokio;

pub mod download;
