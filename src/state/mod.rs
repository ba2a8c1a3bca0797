//! Call session state machine
//!
//! Provides the session controller and the single call it owns:
//! - Idle: no call, toggle starts one
//! - AwaitingPermission / Initializing: permission and remote open in flight
//! - Active / Speaking: connected, following the remote agent's speech
//! - Ending: debounced teardown before returning to Idle

mod machine;
mod session;
mod view;

pub use machine::{CallSettings, Intent, SessionController};
pub use session::{CallSession, MicPermission, Phase};
pub use view::CallView;
