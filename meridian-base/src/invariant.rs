//! Fatal invariant violations (spec §7): protocol errors that must never
//! reach a client because they indicate a bug in the caller, not an expected
//! runtime condition. Logged before panicking so the crash leaves a trace.

pub fn fatal(msg: impl std::fmt::Display) -> ! {
    tracing::error!(target: "meridian::invariant", "{}", msg);
    panic!("{}", msg);
}
