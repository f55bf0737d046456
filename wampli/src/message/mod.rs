pub mod common;
pub mod message;
