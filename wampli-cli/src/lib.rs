//! Command-line client and interactive shell for WAMP routers, built on [`wampli`].
//!
//! Arguments are typed as YAML values, and topics may use glob-like patterns:
//!
//! ```text
//! wampli -u ws://localhost:8080/ws -r realm1 call com.example.add 2 3
//! wampli -u ws://localhost:8080/ws -r realm1 subscribe 'com.example.*.updated'
//! ```

pub mod args;
pub mod commands;
pub mod format;
pub mod shell;
