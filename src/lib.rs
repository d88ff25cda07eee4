pub mod app;
pub mod cli;
pub mod error;
pub mod platform;
pub mod projection;
pub mod providers;
pub mod storage;
pub mod sync;

pub use error::{Error, Result};
