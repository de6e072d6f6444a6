pub mod api;
pub mod config;
pub mod rootpath;
pub mod server;
