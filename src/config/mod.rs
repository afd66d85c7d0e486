//! Configuration module for Flowline
//!
//! - `defaults` - Default constants and values
//! - `store` - Commit log storage configuration

mod defaults;
mod store;

pub use defaults::*;
pub use store::{BrokerRole, FlushDiskType, MessageStoreConfig};
