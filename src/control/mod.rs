pub mod config;
pub mod cookie_cache;
pub mod dispatcher;
pub mod listener;
pub mod stats;
