//! Logging setup for hosts that embed the engine without their own sink.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a stderr logger at info level. Safe to call more than once; only
/// the first call takes effect. Hosts with their own `log` sink should skip
/// this entirely.
pub fn init() {
    INIT.call_once(|| {
        logforth::builder()
            .dispatch(|d| {
                d.filter(log::LevelFilter::Info)
                    .append(logforth::append::Stderr::default())
            })
            .apply();
    });
}
