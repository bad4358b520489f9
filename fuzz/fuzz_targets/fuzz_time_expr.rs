//! Fuzz target for time expression resolution.
//!
//! Resolving an arbitrary expression must return a value or a config error,
//! never panic (overflowing offsets included).

#![no_main]

use catalog_replicator::time_window::{TimeExpr, WindowResolver};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str, i64)| {
    let (start, end, now) = data;
    let resolver = WindowResolver::at(now);

    // Should never panic
    let _ = resolver.resolve(&TimeExpr::Expression(start.to_string()));
    let _ = resolver.resolve_window(
        &TimeExpr::Expression(start.to_string()),
        &TimeExpr::Expression(end.to_string()),
    );
});
