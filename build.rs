use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct TuningSection {
    deque_capacity: Option<usize>,
    max_workers: Option<usize>,
    large_threshold: Option<usize>,
    large_align: Option<usize>,
    refill_count: Option<usize>,
    probe_ticks: Option<u64>,
    seq_threshold: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    tuning: TuningSection,
}

struct Resolved {
    deque_capacity: usize,
    max_workers: usize,
    large_threshold: usize,
    large_align: usize,
    refill_count: usize,
    probe_ticks: u64,
    seq_threshold: usize,
}

fn resolve(cfg: &TuningSection) -> Resolved {
    let deque_capacity = cfg.deque_capacity.unwrap_or(200);
    let max_workers = cfg.max_workers.unwrap_or(128);
    let large_threshold = cfg.large_threshold.unwrap_or(1 << 16);
    let large_align = cfg.large_align.unwrap_or(64);
    let refill_count = cfg.refill_count.unwrap_or(64);
    let probe_ticks = cfg.probe_ticks.unwrap_or(1000);
    let seq_threshold = cfg.seq_threshold.unwrap_or(2048);

    assert!(
        deque_capacity >= 2,
        "deque_capacity ({}) must be at least 2",
        deque_capacity
    );
    // The status-word head field is 7 bits wide.
    assert!(
        max_workers >= 1 && max_workers <= 128,
        "max_workers ({}) must be in 1..=128",
        max_workers
    );
    assert!(
        large_threshold >= 16,
        "large_threshold ({}) must be at least 16",
        large_threshold
    );
    assert!(
        large_align >= 8 && large_align.is_power_of_two(),
        "large_align ({}) must be a power of 2 and at least 8",
        large_align
    );
    assert!(refill_count >= 1, "refill_count must be at least 1");
    assert!(probe_ticks >= 1, "probe_ticks must be at least 1");
    assert!(seq_threshold >= 1, "seq_threshold must be at least 1");

    Resolved {
        deque_capacity,
        max_workers,
        large_threshold,
        large_align,
        refill_count,
        probe_ticks,
        seq_threshold,
    }
}

fn generate(cfg: &Resolved, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const DEQUE_CAPACITY: usize = {};\n\
         pub const MAX_WORKERS: usize = {};\n\
         pub const LARGE_THRESHOLD: usize = {};\n\
         pub const LARGE_ALIGN: usize = {};\n\
         pub const REFILL_COUNT: usize = {};\n\
         pub const PROBE_TICKS: u64 = {};\n\
         pub const SEQ_THRESHOLD: usize = {};\n",
        cfg.deque_capacity,
        cfg.max_workers,
        cfg.large_threshold,
        cfg.large_align,
        cfg.refill_count,
        cfg.probe_ticks,
        cfg.seq_threshold,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/parpool.toml", manifest_dir)
}

fn main() {
    println!("cargo:rerun-if-env-changed=PARPOOL_TUNING");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("PARPOOL_TUNING").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML tuning file");
    let resolved = resolve(&config.tuning);

    generate(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
