use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// duration that deserializes from either plain seconds or a short
/// human form like "90s", "15m", "24h", "30d"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(pub std::time::Duration);

impl Duration {
    pub fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn std(&self) -> std::time::Duration {
        self.0
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty duration".to_string());
        }

        let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => raw.split_at(idx),
            None => (raw, ""),
        };

        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {raw}"))?;

        let secs = match unit {
            "" | "s" => value,
            "m" => value * 60,
            "h" => value * 3600,
            "d" => value * 86400,
            other => return Err(format!("unknown duration unit: {other}")),
        };

        Ok(Self::from_secs(secs))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.as_secs())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("seconds or a duration string like \"15m\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(Duration::from_secs(v as u64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                Duration::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_secs())
    }
}

/// a field that accepts either one string or a list of strings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StringOrList(pub Vec<String>);

impl StringOrList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.0.iter().any(|v| v == value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<String>> for StringOrList {
    fn from(values: Vec<String>) -> Self {
        Self(values)
    }
}

impl<'de> Deserialize<'de> for StringOrList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(v) => Self(vec![v]),
            Raw::Many(vs) => Self(vs),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name cannot be empty".to_string());
        }
        Ok(())
    }
}

/// merges name/value pair lists key-wise, later entries override earlier ones
pub fn merge_pairs(base: &[NameValue], overlay: &[NameValue]) -> Vec<NameValue> {
    if overlay.is_empty() {
        return base.to_vec();
    }
    if base.is_empty() {
        return overlay.to_vec();
    }

    let mut merged: Vec<NameValue> = base.to_vec();
    for nv in overlay {
        match merged.iter_mut().find(|m| m.name == nv.name) {
            Some(existing) => existing.value = nv.value.clone(),
            None => merged.push(nv.clone()),
        }
    }
    merged
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpClientSettings {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub headers: Vec<NameValue>,
}

impl HttpClientSettings {
    pub fn validate_global(&self) -> Result<(), String> {
        self.cache.validate_global()?;
        for (i, header) in self.headers.iter().enumerate() {
            header
                .validate()
                .map_err(|e| format!("header[{i}]: {e}"))?;
        }
        Ok(())
    }

    pub fn validate_override(&self) -> Result<(), String> {
        self.cache.validate_override()?;
        for (i, header) in self.headers.iter().enumerate() {
            header
                .validate()
                .map_err(|e| format!("header[{i}]: {e}"))?;
        }
        Ok(())
    }

    /// overlays non-empty fields of `other` on top of self
    pub fn merged_with(&self, other: &HttpClientSettings) -> HttpClientSettings {
        let mut result = self.clone();
        if other.cache.enabled.is_some() {
            result.cache.enabled = other.cache.enabled;
        }
        if other.cache.ttl.is_some() {
            result.cache.ttl = other.cache.ttl;
        }
        if other.cache.retention.is_some() {
            result.cache.retention = other.cache.retention;
        }
        if other.cache.compression.is_some() {
            result.cache.compression = other.cache.compression;
        }
        if !other.headers.is_empty() {
            result.headers = other.headers.clone();
        }
        result
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: Option<bool>,
    pub path: Option<String>,
    pub ttl: Option<Duration>,
    pub retention: Option<Duration>,
    pub compression: Option<bool>,
}

impl CacheSettings {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    pub fn validate_global(&self) -> Result<(), String> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.path.as_deref().unwrap_or("").is_empty() {
            return Err("cache: path is required when cache is enabled".to_string());
        }
        if self.ttl.map(|t| t.is_zero()).unwrap_or(true) {
            return Err("cache: ttl must be positive when cache is enabled".to_string());
        }
        if self.retention.map(|t| t.is_zero()).unwrap_or(true) {
            return Err("cache: retention must be positive when cache is enabled".to_string());
        }
        Ok(())
    }

    /// cache path can only be configured at the global level
    pub fn validate_override(&self) -> Result<(), String> {
        if self.path.is_some() {
            return Err("cache: path can only be configured at the global level".to_string());
        }
        if self.enabled == Some(false) && self.ttl.is_some() {
            return Err("cache: ttl cannot be set when cache is disabled".to_string());
        }
        Ok(())
    }
}
