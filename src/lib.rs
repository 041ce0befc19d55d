pub mod core;
pub mod logging;
pub mod network;
pub mod protocol;
