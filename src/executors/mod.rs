// Module: Executors
// Builds and issues the HTTP request of a resolved step.

pub mod http;

pub use http::{
    matching_handlers, ExecutionOutcome, HttpExchange, HttpStepExecutor, PreparedBody,
    PreparedField, PreparedRequest,
};
