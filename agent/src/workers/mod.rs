pub mod heartbeat;
pub mod sync;
