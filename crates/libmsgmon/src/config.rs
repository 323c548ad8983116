use serde::Deserialize;

use crate::error::MonitorError;

const DEFAULT_CAPACITY: usize = 1_000;
const DEFAULT_COMMAND_QUEUE: usize = 256;

/// Settings applied uniformly to every log the router creates.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Maximum buffered entries per log, for both history and display list.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Depth of each log's command queue.
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
}

impl MonitorConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.capacity == 0 {
            return Err(MonitorError::InvalidConfig(
                "capacity must be at least 1".to_string(),
            ));
        }
        if self.command_queue == 0 {
            return Err(MonitorError::InvalidConfig(
                "command_queue must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            command_queue: DEFAULT_COMMAND_QUEUE,
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_command_queue() -> usize {
    DEFAULT_COMMAND_QUEUE
}
