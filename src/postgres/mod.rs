// ABOUTME: PostgreSQL plumbing shared by sources and sinks
// ABOUTME: Connection pools plus typed value binding and the NUMERIC wire format

mod numeric;
pub mod pool;
pub mod types;

pub use pool::build_pool;
pub use types::WriteTimestamp;
