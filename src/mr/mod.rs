pub mod app;
pub mod config;
pub mod coordinator;
pub mod rpc;
pub mod worker;
