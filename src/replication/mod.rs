//! Neighborhood replication: snapshot initialization of new followers,
//! queued change propagation, and idempotent application of neighbor updates.

pub mod inbound;
pub mod outbound;
pub mod worker;

pub use worker::{join_neighborhood, run_action_worker, PeerClient, WorkerError};
