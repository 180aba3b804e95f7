//! Wire codec: hex encode/decode, the framed payload envelope, and the
//! device-type router that dispatches decoded `Telecast` messages.

pub mod frame;
pub mod hex;
pub mod router;

pub use frame::{parse, FrameResult};
pub use router::{route, RouterContext};
