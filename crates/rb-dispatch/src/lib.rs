//! Request Dispatcher
//!
//! This crate provides the transport-independent request handling:
//! - Dispatcher: queue name / operation lookup, worker invocation, reply construction
//! - schema: required-field validation and lenient media extraction

pub mod dispatcher;
pub mod schema;

pub use dispatcher::Dispatcher;
