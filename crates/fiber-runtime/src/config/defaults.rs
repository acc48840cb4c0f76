//! Compile-time defaults, merged by build.rs from the built-in values and
//! an optional `FIBER_CONFIG_RS` override file.

include!(concat!(env!("OUT_DIR"), "/fiber_merged_config.rs"));
