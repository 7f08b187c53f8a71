pub mod backup;
pub mod cli;
pub mod config;
pub mod database;
pub mod destination;
pub mod error;
pub mod log;
pub mod source;
pub mod status;
