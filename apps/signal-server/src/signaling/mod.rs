pub mod handler;
pub mod registry;
pub mod relay;
pub mod server;
