//! HTTP surface of the messaging service.

pub mod handlers;

pub use handlers::{health_check, publish_group_created, AppState};
