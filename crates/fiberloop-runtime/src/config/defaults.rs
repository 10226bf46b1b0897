//! Compile-time defaults, merged by build.rs from the library values and
//! an optional `FL_CONFIG_RS` override file.

include!(concat!(env!("OUT_DIR"), "/fl_merged_config.rs"));
