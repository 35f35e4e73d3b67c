/// Bump a counter in [`crate::stats`].
///
/// `stat!(steal_count)` adds one; `stat!(os_alloc_bytes, n)` adds `n`. The
/// counter name must be a field of the stats table, so a typo fails to
/// compile rather than counting into the void. With the `stats` feature
/// disabled both forms (including the value expression) compile away.
#[macro_export]
macro_rules! stat {
    ($counter:ident) => {
        $crate::stat!($counter, 1u64);
    };
    ($counter:ident, $amount:expr) => {
        #[cfg(feature = "stats")]
        {
            $crate::stats::STATS
                .$counter
                .fetch_add($amount as u64, ::core::sync::atomic::Ordering::Relaxed);
        }
    };
}
