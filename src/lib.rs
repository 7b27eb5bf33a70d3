pub mod config;
pub mod crypto;
pub mod db;
pub mod handlers;
pub mod images;
pub mod net;
pub mod relay;
pub mod replication;
pub mod search;
pub mod types;

pub use config::Config;
pub use crypto::{identity_id, sha256, verify, Keypair};
pub use db::Store;
pub use images::ImageStore;
pub use net::{start, ServerContext};
pub use replication::{join_neighborhood, PeerClient};
pub use types::*;
