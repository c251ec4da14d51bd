pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;
pub mod tree;
pub mod web;
pub mod wire;
