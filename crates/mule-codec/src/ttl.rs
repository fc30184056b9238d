use mule_core::clock::{DAY, HOUR};
use mule_core::{Priority, TOPIC_KNOWLEDGE, TOPIC_MUTUAL_AID};
use serde::{Deserialize, Serialize};

pub const EMERGENCY_TTL_RANGE: (u64, u64) = (6 * HOUR, 24 * HOUR);
pub const PERISHABLE_TTL_RANGE: (u64, u64) = (24 * HOUR, 72 * HOUR);
pub const KNOWLEDGE_TTL_RANGE: (u64, u64) = (180 * DAY, 365 * DAY);

const PERISHABLE_TAGS: [&str; 2] = ["food", "perishable"];

/// Default lifetimes (seconds) applied when a producer gives no explicit TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlTable {
    pub emergency_secs: u64,
    pub perishable_secs: u64,
    pub knowledge_secs: u64,
    pub default_secs: u64,
}

impl Default for TtlTable {
    fn default() -> Self {
        Self {
            emergency_secs: 12 * HOUR,
            perishable_secs: 48 * HOUR,
            knowledge_secs: 365 * DAY,
            default_secs: 7 * DAY,
        }
    }
}

impl TtlTable {
    /// Pins each class into its allowed window. `default_secs` is only kept non-zero.
    pub fn clamped(self) -> Self {
        Self {
            emergency_secs: clamp(self.emergency_secs, EMERGENCY_TTL_RANGE),
            perishable_secs: clamp(self.perishable_secs, PERISHABLE_TTL_RANGE),
            knowledge_secs: clamp(self.knowledge_secs, KNOWLEDGE_TTL_RANGE),
            default_secs: self.default_secs.max(1),
        }
    }

    /// Picks the lifetime class for a bundle. Tags are expected normalized.
    pub fn ttl_for(&self, priority: Priority, topic: Option<&str>, tags: &[String]) -> u64 {
        if priority == Priority::Emergency {
            return self.emergency_secs;
        }
        let food_tagged = tags
            .iter()
            .any(|tag| PERISHABLE_TAGS.contains(&tag.as_str()));
        if priority == Priority::Perishable || (topic == Some(TOPIC_MUTUAL_AID) && food_tagged) {
            return self.perishable_secs;
        }
        if topic == Some(TOPIC_KNOWLEDGE) {
            return self.knowledge_secs;
        }
        self.default_secs
    }
}

fn clamp(value: u64, (lo, hi): (u64, u64)) -> u64 {
    value.clamp(lo, hi)
}
