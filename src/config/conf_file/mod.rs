//! `key = value` configuration file.
//!
//! Option text is copied into a single backing buffer whose capacity is
//! bounded. When the buffer is exhausted the whole input is parsed again
//! from scratch with twice the capacity, up to [`MAX_CAPACITY`]. Parsing
//! is pure, so the result never depends on the starting capacity.

use std::collections::BTreeMap;
use std::ops::Range;

use ::config::{Map, Source, Value, ValueKind};
use tracing::{debug, warn};

use super::ConfigError;

/// Capacity of the first parse attempt, in bytes.
pub const INITIAL_CAPACITY: usize = 1024;
/// Largest backing buffer a configuration file may require.
pub const MAX_CAPACITY: usize = 1024 * 1024;

/// How a recognised key's value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueType {
    Text,
    Integer,
    Boolean,
}

const KNOWN_KEYS: &[(&str, ValueType)] = &[
    ("connection", ValueType::Text),
    ("exchange", ValueType::Text),
    ("routing_key", ValueType::Text),
    ("cacert", ValueType::Text),
    ("ipc_key_prefix", ValueType::Text),
    ("connection_attempts", ValueType::Integer),
    ("retry_delay", ValueType::Integer),
    ("heartbeat", ValueType::Integer),
    ("enable_ssl", ValueType::Boolean),
    ("verify_peer", ValueType::Boolean),
    ("verify_hostname", ValueType::Boolean),
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Setting {
    Text(Range<usize>),
    Integer(i64),
    Boolean(bool),
}

/// Backing buffer ran out of room; the parse must restart with more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

/// Parsed configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfFile {
    origin: Range<usize>,
    storage: String,
    settings: BTreeMap<&'static str, Setting>,
}

impl ConfFile {
    /// Parse `input`, growing the backing buffer as needed.
    pub fn parse(origin: &str, input: &str) -> Result<Self, ConfigError> {
        Self::parse_from(origin, input, INITIAL_CAPACITY)
    }

    /// Parse starting from an explicit capacity, doubling on exhaustion.
    pub fn parse_from(origin: &str, input: &str, initial: usize) -> Result<Self, ConfigError> {
        let mut capacity = initial.max(1);
        loop {
            match Self::parse_with_capacity(origin, input, capacity) {
                Ok(file) => return Ok(file),
                Err(Exhausted) if capacity < MAX_CAPACITY => {
                    debug!(capacity, "Config storage exhausted, growing");
                    capacity = (capacity * 2).min(MAX_CAPACITY);
                }
                Err(Exhausted) => {
                    return Err(ConfigError::TooLarge {
                        limit: MAX_CAPACITY,
                    })
                }
            }
        }
    }

    /// Single parse attempt with a fixed amount of option storage.
    pub fn parse_with_capacity(
        origin: &str,
        input: &str,
        capacity: usize,
    ) -> Result<Self, Exhausted> {
        let mut file = Self {
            origin: 0..0,
            storage: String::with_capacity(capacity),
            settings: BTreeMap::new(),
        };
        file.origin = file.store(origin, capacity)?;

        for line in input.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            let Some(&(name, value_type)) = KNOWN_KEYS.iter().find(|(k, _)| *k == key) else {
                debug!(key = %key, "Ignoring unknown config key");
                continue;
            };

            match value_type {
                ValueType::Text => {
                    let span = file.store(value, capacity)?;
                    file.settings.insert(name, Setting::Text(span));
                }
                ValueType::Integer => match parse_integer(value) {
                    Some(n) => {
                        file.settings.insert(name, Setting::Integer(n));
                    }
                    None => warn!(key = %name, value = %value, "Not an integer, keeping previous value"),
                },
                ValueType::Boolean => match parse_bool(value) {
                    Some(b) => {
                        file.settings.insert(name, Setting::Boolean(b));
                    }
                    None => warn!(key = %name, value = %value, "Not a boolean, keeping previous value"),
                },
            }
        }

        Ok(file)
    }

    fn store(&mut self, value: &str, capacity: usize) -> Result<Range<usize>, Exhausted> {
        let start = self.storage.len();
        if start + value.len() > capacity {
            return Err(Exhausted);
        }
        self.storage.push_str(value);
        Ok(start..self.storage.len())
    }

    /// Where the file came from (usually its path).
    pub fn origin(&self) -> &str {
        &self.storage[self.origin.clone()]
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.settings.get(key)? {
            Setting::Text(span) => Some(&self.storage[span.clone()]),
            _ => None,
        }
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.settings.get(key)? {
            Setting::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn boolean(&self, key: &str) -> Option<bool> {
        match self.settings.get(key)? {
            Setting::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Number of recognised keys that were set.
    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

impl Source for ConfFile {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ::config::ConfigError> {
        let origin = self.origin().to_string();
        Ok(self
            .settings
            .iter()
            .map(|(key, setting)| {
                let kind = match setting {
                    Setting::Text(span) => ValueKind::String(self.storage[span.clone()].to_string()),
                    Setting::Integer(n) => ValueKind::I64(*n),
                    Setting::Boolean(b) => ValueKind::Boolean(*b),
                };
                (key.to_string(), Value::new(Some(&origin), kind))
            })
            .collect())
    }
}

/// Interpret a boolean token.
///
/// `yes`, `true`, `1`, `on` are true and `no`, `false`, `0`, `off` are false,
/// in any case. Anything else is `None`.
pub fn parse_bool(token: &str) -> Option<bool> {
    const TRUE: [&str; 4] = ["yes", "true", "1", "on"];
    const FALSE: [&str; 4] = ["no", "false", "0", "off"];

    let token = token.trim();
    if TRUE.iter().any(|t| token.eq_ignore_ascii_case(t)) {
        Some(true)
    } else if FALSE.iter().any(|t| token.eq_ignore_ascii_case(t)) {
        Some(false)
    } else {
        None
    }
}

/// Leading decimal integer of `value`, ignoring whatever follows it.
///
/// `"10 # seconds"` parses as 10. Returns `None` when there are no digits.
pub fn parse_integer(value: &str) -> Option<i64> {
    let value = value.trim_start();
    let (negative, digits) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude: i64 = digits[..end].parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests;
