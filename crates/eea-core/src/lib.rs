//! Core types shared by the embedded edge agent: configuration, the error
//! taxonomy, the inbound/outbound message model, the routing queues and the
//! durable bundle store.

pub mod config;
pub mod error;
pub mod reading;
pub mod router;
pub mod store;
pub mod types;

pub use config::*;
pub use error::{Error, Result};
pub use reading::LatestReading;
pub use router::{EventQueue, Router};
pub use store::BundleStore;
pub use types::*;
