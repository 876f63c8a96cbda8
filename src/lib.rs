//! Backend for QR pet tags: tag registry and scans, subscription coverage,
//! the loyalty reward cycle and tag order provisioning.

mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod loyalty;
pub mod orders;
pub mod qr;
mod responses;
pub mod store;
pub mod subscription;
mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::init_router;
pub use types::*;
