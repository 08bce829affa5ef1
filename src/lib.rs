//! A per-node interconnect proxy.
//!
//! Every backend process of a node talks to the local proxy over one Unix
//! socket; proxies of different nodes exchange the multiplexed traffic over
//! one TCP connection per node pair.
pub mod addr;
pub mod backend;
pub mod config;
pub mod packet;
pub mod proxy;
pub mod server;

pub use backend::BackendConnection;
pub use config::{Config, ConfigSource, Overrides};
pub use server::{Server, ServerHandle};
