//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: fetches locked instance batches and runs replay turns
//! - `worker`: executes activities and reports their completions

mod orchestration;
mod worker;
