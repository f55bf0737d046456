pub mod core;
pub mod message;
pub mod serializer;
pub mod session;
pub mod transport;
