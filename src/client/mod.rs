//! Client library
//!
//! Transports (in-process and HTTP/WebSocket), the shared entity cache,
//! edition sessions with presence and optimistic patches, and paginated list
//! views.

pub mod cache;
pub mod edition;
pub mod http;
pub mod list;
pub mod transport;

pub use cache::{LocalCache, MergeReport};
pub use edition::{EditionSession, PatchReceipt, SubmitError};
pub use http::HttpTransport;
pub use list::{ListView, DEFAULT_LIST_PAGE_SIZE};
pub use transport::{LocalTransport, Subscription, Transport};
