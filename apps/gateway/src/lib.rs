pub mod attach;
pub mod config;
pub mod proxy;
pub mod terminal;
