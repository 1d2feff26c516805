//! Remote client for the tracker's REST API.

pub mod api_types;
mod client;
pub mod transport;

pub use api_types::Record;
pub use client::RemoteClient;
pub use transport::{HttpTransport, Transport};
