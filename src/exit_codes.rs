//! Named exit codes for every intentional `std::process::exit` call site.
//!
//! The gateway's sole recovery mechanism is exiting and letting the
//! orchestrator restart the whole process. Giving each trigger its own
//! code keeps the distinction visible in container logs and postmortems
//! instead of every shutdown looking like a generic `1`.

/// `HALT` environment variable was set at startup.
pub const HALT_REQUESTED: i32 = 0;
/// Serial reply watchdog reached its tick ceiling without a reply.
pub const SERIAL_WATCHDOG: i32 = 10;
/// Cloud service unreachable past `restart_when_unreachable_minutes`.
pub const EXTENDED_OUTAGE: i32 = 11;
/// The 7-day clean-restart safeguard elapsed.
pub const UPTIME_LIMIT: i32 = 12;
