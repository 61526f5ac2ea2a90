pub mod config;
pub mod downstream;
pub mod logger;
pub mod monitor;
pub mod reports;
pub mod state;
pub mod upstream;
