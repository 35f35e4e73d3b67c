//! Build-time tuning constants, generated by `build.rs` from `parpool.toml`
//! (or the file named by the `PARPOOL_TUNING` env var).

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
