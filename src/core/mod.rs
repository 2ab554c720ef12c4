// Core modules: script invocation, request adaptation, and error modeling.
pub mod adapter;
pub mod error;
pub mod runner;
