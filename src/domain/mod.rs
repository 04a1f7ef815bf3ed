pub mod fleet_service;
pub mod node;
pub mod node_store;
pub mod snapshot_store;
pub mod topology;
pub mod types;
