//! Logging configuration for the kernel compiler
//!
//! The library only emits records through the `log` facade (and `tracing`,
//! which forwards to `log`); installing a logger is left to the embedding
//! runtime or to tests via the helpers here.
//!
//! # Log Levels
//!
//! - `error!` - Compile units that failed
//! - `warn!` - Fallbacks such as serialised parallel loops
//! - `info!` - One line per compile unit and per tier
//! - `debug!` - Per-phase statistics, variable allocation totals
//! - `trace!` - Graph dumps and emitted LIR
//!
//! # Environment Variable
//!
//! ```bash
//! RUST_LOG=kernel_compiler=debug cargo test
//! RUST_LOG=kernel_compiler::codegen=trace cargo test
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging at Warn level. Subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level. Subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from RUST_LOG, defaulting to Warn.
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Initialize logging for tests; safe to call from every test.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .parse_default_env()
        .is_test(true)
        .try_init();
}

/// Whether one of the `init*` helpers installed the logger.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test();
        init_test();
    }

    #[test]
    fn test_tracing_events_do_not_panic() {
        init_test();
        log::debug!("log record");
        tracing::debug!(phase = "canonicalize", "tracing event");
    }
}
