// Library root for the Obsidian Agent API

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod middleware;

// Re-export commonly used types
pub use app::{create_router, AppState};
pub use config::{get_settings, Settings};
pub use db::{Database, DatabaseProbe};
pub use error::{DatabaseError, HttpError};
