// Clippy allows for reasonable defaults
#![allow(clippy::too_many_arguments)] // Constructors wire several collaborators
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::field_reassign_with_default)] // Config tweaks in tests read better this way

// Module declarations
pub mod config;
pub mod detection;
pub mod errors;
pub mod events;
pub mod health;
pub mod history;
pub mod interceptor;
pub mod models;
pub mod output;
pub mod patterns;
pub mod pilot;
pub mod queue;
pub mod session;
pub mod shutdown;
pub mod utils;

pub use config::{ConfigManager, PilotConfig};
pub use errors::{PilotError, PilotResult};
pub use events::{EventBroadcaster, PilotEvent};
pub use models::*;
pub use pilot::{Pilot, PilotCommand, PilotContext};
