use glob::{MatchOptions, Pattern};

use crate::{GustError, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// MQTT-style topic filter
/// Examples: "realm/s/benchmark_ab12c/#", "realm/s/+/camera_1"
#[derive(Debug, Clone)]
pub struct TopicFilter {
    pattern: Pattern,
    // "a/b/#" also matches the parent topic "a/b"
    parent: Option<String>,
}

impl TopicFilter {
    pub fn new(filter: &str) -> Result<Self> {
        if filter.is_empty() {
            return Err(GustError::Protocol("Empty topic filter".to_string()));
        }

        let levels: Vec<&str> = filter.split('/').collect();
        let mut glob_levels = Vec::with_capacity(levels.len());
        for (i, level) in levels.iter().enumerate() {
            match *level {
                "#" if i + 1 == levels.len() => glob_levels.push("**".to_string()),
                "+" => glob_levels.push("*".to_string()),
                l if l.contains('#') || l.contains('+') => {
                    return Err(GustError::Protocol(format!(
                        "Invalid wildcard placement in filter: {}",
                        filter
                    )));
                }
                l => glob_levels.push(Pattern::escape(l)),
            }
        }

        let pattern = Pattern::new(&glob_levels.join("/"))
            .map_err(|e| GustError::Protocol(format!("Invalid filter {}: {}", filter, e)))?;
        let parent = filter.strip_suffix("/#").map(str::to_string);

        Ok(Self { pattern, parent })
    }

    pub fn matches(&self, topic: &str) -> bool {
        if self.parent.as_deref() == Some(topic) {
            return true;
        }
        self.pattern.matches_with(topic, MATCH_OPTIONS)
    }
}
