pub mod health;
pub mod pool;
pub mod retention;
pub mod server;
pub mod strategy;

pub use health::run_health_checks;
pub use pool::{BackendGroup, Manager};
pub use server::Backend;
pub use strategy::Strategy;
