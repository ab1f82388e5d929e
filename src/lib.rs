pub mod config;
pub mod error;
pub mod feed;
pub mod hub;
pub mod identity;
pub mod replication;
