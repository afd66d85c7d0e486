//! Delay level table for scheduled delivery
//!
//! Messages with a delay level are rerouted to the reserved schedule topic;
//! each level maps to one queue and one fixed delay. The table is parsed
//! from a config string such as `"1s 5s 10s 30s 1m 2m … 2h"`.

use crate::error::{FlowlineError, Result};

/// Reserved topic that scheduled messages are parked under
pub const SCHEDULE_TOPIC: &str = "SCHEDULE_TOPIC_XXXX";

/// Parsed delay level table; level `n` (1-based) delays by `levels[n-1]` ms
#[derive(Debug, Clone)]
pub struct DelayLevelTable {
    levels: Vec<i64>,
}

impl DelayLevelTable {
    /// Parse a space-separated list of delays with `s`/`m`/`h`/`d` suffixes
    pub fn parse(table: &str) -> Result<Self> {
        let mut levels = Vec::new();
        for token in table.split_whitespace() {
            let unit = token.chars().last().unwrap_or(' ');
            let value = &token[..token.len() - unit.len_utf8()];
            let scale: i64 = match unit {
                's' => 1000,
                'm' => 1000 * 60,
                'h' => 1000 * 60 * 60,
                'd' => 1000 * 60 * 60 * 24,
                _ => {
                    return Err(FlowlineError::Config(format!(
                        "invalid delay level token: {token}"
                    )))
                }
            };
            let value: i64 = value.parse().map_err(|_| {
                FlowlineError::Config(format!("invalid delay level token: {token}"))
            })?;
            levels.push(value * scale);
        }

        if levels.is_empty() {
            return Err(FlowlineError::Config(
                "delay level table is empty".to_string(),
            ));
        }

        Ok(Self { levels })
    }

    /// Highest valid delay level
    pub fn max_delay_level(&self) -> i32 {
        self.levels.len() as i32
    }

    /// Clamp a producer-supplied level into the valid range
    pub fn clamp_level(&self, level: i32) -> i32 {
        level.min(self.max_delay_level())
    }

    /// Queue within the schedule topic that holds this level
    pub fn delay_level_to_queue_id(level: i32) -> i32 {
        level - 1
    }

    /// Absolute deliver timestamp for a record stored at `store_timestamp`
    ///
    /// The level is clamped; level 0 or below delivers immediately.
    pub fn compute_deliver_timestamp(&self, level: i32, store_timestamp: i64) -> i64 {
        let level = self.clamp_level(level);
        if level <= 0 {
            return store_timestamp;
        }
        store_timestamp + self.levels[(level - 1) as usize]
    }
}
