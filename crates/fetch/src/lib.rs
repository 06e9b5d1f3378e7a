//! Fetch-surface value objects visible inside an execution context.
//!
//! Everything in this crate is a pure value: constructing a Request,
//! reading its body, or parsing a multipart form never touches the
//! network, the filesystem, or a clock. Body reads are idempotent; the
//! stored body is never mutated by a read.

pub mod body;
pub mod headers;
pub mod multipart;
pub mod request;
pub mod response;

pub use body::{Body, BodyError, FormDataError};
pub use headers::Headers;
pub use multipart::parse_multipart;
pub use request::Request;
pub use response::Response;
