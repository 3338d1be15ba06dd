pub mod messages;
pub mod rooms;
pub mod server;

pub use rooms::{Registry, ServerStats};
pub use server::{router, run_relay, FanoutState};
