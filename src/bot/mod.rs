//! Meeting bot audio coordination (pipeline stage D)
//!
//! The bot is a long-lived process attached to one meeting. It consumes
//! synthesized audio records, gates them by recognizer session, plays
//! them through the meeting browser while the bot's microphone is
//! muted, and reports its exit to the bot manager.

mod bridge;
mod manager;
mod player;
mod service;
mod session;

pub use bridge::{launch_meeting_browser, BridgeEvent, CdpBridge, PlaybackBridge};
pub use manager::{exit_code, ManagerClient};
pub use player::{AudioPlayer, PlaybackState, QueuedAudio};
pub use service::{AudioGateHandler, BotService};
pub use session::{GateDecision, SessionBinding};
