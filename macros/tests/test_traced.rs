use recycle_macros::test_traced;
use tracing::{debug, trace, warn, Level};

#[test_traced("TRACE")]
fn test_positional_trace_enables_everything() {
    assert!(tracing::enabled!(Level::TRACE));
    trace!(slot = 3, "claimed slot");
}

#[test_traced("warn")]
fn test_positional_level_is_case_insensitive() {
    assert!(tracing::enabled!(Level::WARN));
    assert!(!tracing::enabled!(Level::INFO));
    warn!("pool exhausted");
}

#[test_traced]
fn test_default_is_debug() {
    assert!(tracing::enabled!(Level::DEBUG));
    assert!(!tracing::enabled!(Level::TRACE));
    debug!(freed = 2, "flushed pool");
}

#[test_traced(level = "ERROR")]
fn test_named_level() {
    assert!(tracing::enabled!(Level::ERROR));
    assert!(!tracing::enabled!(Level::WARN));
}

#[test_traced]
#[should_panic(expected = "segment")]
fn test_panic_propagates() {
    panic!("segment allocation failed");
}
