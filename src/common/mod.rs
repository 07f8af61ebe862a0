//! Common utilities and types

pub mod batch;
pub mod error;
pub mod metadata;
pub mod net;
pub mod singledo;
pub mod socks;
pub mod tls;

pub use error::{Error, Result};
pub use metadata::{Metadata, Network};
pub use singledo::Single;
