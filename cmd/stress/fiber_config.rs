//! Example build-time configuration for the fiber runtime
//!
//! Usage:
//!   FIBER_CONFIG_RS=$PWD/cmd/stress/fiber_config.rs cargo build -p fiber-stress --release
//!
//! Only the parameters listed here change; everything else keeps the
//! library default. Environment variables still win at runtime:
//!   FIBER_CONCURRENCY=16 ./target/release/stress

// Worker threads across all tags
pub const CONCURRENCY: usize = 8;

// Stress fibers are tiny; keep more small stacks per thread
pub const TC_STACK_SMALL: usize = 256;

// Spin a little before parking
pub const YIELD_BEFORE_IDLE: u32 = 2;
