//! Leaf utilities shared by the network layer and the script runtime:
//! owned byte buffers, connection-string URLs and the data/config path layout.

pub mod blob;
pub mod paths;
pub mod url;

pub use blob::{Blob, BlobBuffer, BlobError};
pub use paths::{PathEnv, PathError, Paths};
pub use url::{Url, UrlError};
