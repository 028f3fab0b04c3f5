use crate::error::CommandError;
use crate::publisher::Priority;
use serde::Deserialize;

pub const MAX_COMMAND_SIZE: usize = 512;

/// Commands the broker side can push down to the gateway, e.g.
/// `{"command":"alert","event":"fall_detected","priority":"high"}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Republish every aggregate now.
    PublishNow,
    /// Clear a failed link and start connecting again.
    ResetLink,
    Alert {
        event: String,
        #[serde(default = "default_alert_priority")]
        priority: Priority,
    },
    /// Log the current gateway status.
    Status,
}

fn default_alert_priority() -> Priority {
    Priority::High
}

pub fn parse_command(bytes: &[u8]) -> Result<GatewayCommand, CommandError> {
    if bytes.len() > MAX_COMMAND_SIZE {
        return Err(CommandError::TooLarge {
            max: MAX_COMMAND_SIZE,
        });
    }

    serde_json::from_slice(bytes).map_err(|_| CommandError::InvalidJson)
}
