//! Everything that talks directly to the RN2483/RN2903 transceiver: the
//! serial link, the GPIO hardware-reset line, region programming, and the
//! command state machine that sequences them.

pub mod gpio;
pub mod region;
pub mod serial;
pub mod state_machine;

pub use gpio::{GpioError, NullReset, RadioReset, ResetLine};
pub use region::Region;
pub use serial::{RadioError, ReplyWatchdog, SerialWriter};
pub use state_machine::{CommandStateMachine, GatewayIdentity, State};
