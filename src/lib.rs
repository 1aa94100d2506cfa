pub mod common;
pub mod client;
pub mod utils;
