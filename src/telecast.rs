//! Generated Telecast protobuf types.
//!
//! `build.rs` compiles `proto/telecast.proto` with `prost-build`; the
//! generated module is pulled in here rather than scattering `include!`
//! calls through the rest of the crate.

include!(concat!(env!("OUT_DIR"), "/teletype.rs"));

pub use self::telecast::DeviceType;
pub use self::telecast::ReplyType;

/// Sentinel SNR value used when a received line carried no parseable SNR
/// reading. Matches the original gateway's `invalidSNR` constant.
pub const INVALID_SNR: f32 = 123.456;
