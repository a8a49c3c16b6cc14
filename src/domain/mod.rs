pub mod dispatch;
pub mod heartbeat;
pub mod models;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod settings;
