pub mod daemon;
pub mod node;
