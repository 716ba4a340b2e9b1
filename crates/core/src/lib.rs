pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod manager;
pub mod models;
pub mod normalize;
pub mod relay;
pub mod runner;

pub use crate::error::{Error, Result};
pub use crate::manager::ScanManager;
pub use crate::models::*;
