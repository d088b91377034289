pub mod log;
pub mod net;
pub mod retry;
