pub mod app;
pub mod cli;
pub mod config;
pub mod email;
pub mod imap;
pub mod mime;
pub mod smtp;

pub use app::{App, AppError, AppResult};
pub use config::RelayConfig;
