pub mod instance;
pub mod position;

// Re-export for easier access
pub use instance::InstanceId;
pub use position::PositionAddress;
