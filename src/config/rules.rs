use std::fmt;

use regex::Regex;
use serde::de::{self, Deserializer};
use serde::Deserialize;

use super::common::StringOrList;

/// compiled regex that deserializes straight from the config string
#[derive(Debug, Clone)]
pub struct Pattern(pub Regex);

impl Pattern {
    pub fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }

    /// removes the matched portion, used to derive group base names
    pub fn strip(&self, value: &str) -> String {
        self.0.replace_all(value, "").trim().to_string()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Regex::new(&raw)
            .map(Pattern)
            .map_err(|e| de::Error::custom(format!("invalid pattern {raw:?}: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    Name,
    Attr,
    Tag,
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorKind::Name => f.write_str("name"),
            SelectorKind::Attr => f.write_str("attr"),
            SelectorKind::Tag => f.write_str("tag"),
        }
    }
}

/// addresses one field of a channel: its display name, or one of its
/// EXTINF attributes or auxiliary tags
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Selector {
    #[serde(rename = "type")]
    pub kind: SelectorKind,
    #[serde(default)]
    pub value: Option<String>,
}

impl Selector {
    pub fn validate(&self) -> Result<(), String> {
        match self.kind {
            SelectorKind::Name => Ok(()),
            SelectorKind::Attr | SelectorKind::Tag => {
                if self.value.as_deref().unwrap_or("").is_empty() {
                    Err(format!("selector type {} requires a value", self.kind))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// all present clauses must hold; an empty condition always matches
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub clients: StringOrList,
    #[serde(default)]
    pub playlists: StringOrList,
    #[serde(default)]
    pub selector: Option<Selector>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub and: Vec<Condition>,
    #[serde(default)]
    pub or: Vec<Condition>,
}

impl Condition {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(selector) = &self.selector {
            selector.validate()?;
            if self.patterns.is_empty() {
                return Err("condition selector requires patterns".to_string());
            }
        } else if !self.patterns.is_empty() {
            return Err("condition patterns require a selector".to_string());
        }
        for c in self.and.iter().chain(self.or.iter()) {
            c.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetFieldRule {
    pub selector: Selector,
    pub template: String,
    #[serde(default)]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveFieldRule {
    pub selector: Selector,
    #[serde(default)]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveChannelRule {
    #[serde(default)]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkHiddenRule {
    #[serde(default)]
    pub condition: Option<Condition>,
}

/// exactly one of the variants must be present per rule entry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelRule {
    #[serde(default)]
    pub set_field: Option<SetFieldRule>,
    #[serde(default)]
    pub remove_field: Option<RemoveFieldRule>,
    #[serde(default)]
    pub remove_channel: Option<RemoveChannelRule>,
    #[serde(default)]
    pub mark_hidden: Option<MarkHiddenRule>,
}

impl ChannelRule {
    pub fn validate(&self) -> Result<(), String> {
        let set = [
            self.set_field.is_some(),
            self.remove_field.is_some(),
            self.remove_channel.is_some(),
            self.mark_hidden.is_some(),
        ]
        .iter()
        .filter(|v| **v)
        .count();
        if set != 1 {
            return Err("channel rule must contain exactly one action".to_string());
        }

        if let Some(rule) = &self.set_field {
            rule.selector.validate()?;
            if let Some(c) = &rule.condition {
                c.validate()?;
            }
        }
        if let Some(rule) = &self.remove_field {
            rule.selector.validate()?;
            if let Some(c) = &rule.condition {
                c.validate()?;
            }
        }
        if let Some(rule) = &self.remove_channel {
            if let Some(c) = &rule.condition {
                c.validate()?;
            }
        }
        if let Some(rule) = &self.mark_hidden {
            if let Some(c) = &rule.condition {
                c.validate()?;
            }
        }
        Ok(())
    }

    pub fn condition(&self) -> Option<&Condition> {
        if let Some(r) = &self.set_field {
            return r.condition.as_ref();
        }
        if let Some(r) = &self.remove_field {
            return r.condition.as_ref();
        }
        if let Some(r) = &self.remove_channel {
            return r.condition.as_ref();
        }
        if let Some(r) = &self.mark_hidden {
            return r.condition.as_ref();
        }
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinalValue {
    pub selector: Selector,
    pub template: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeChannelsRule {
    pub selector: Selector,
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub final_value: Option<FinalValue>,
    #[serde(default)]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveDuplicatesRule {
    pub selector: Selector,
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub final_value: Option<FinalValue>,
    #[serde(default)]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SortRule {
    pub selector: Selector,
    #[serde(default)]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaylistRule {
    #[serde(default)]
    pub merge_channels: Option<MergeChannelsRule>,
    #[serde(default)]
    pub remove_duplicates: Option<RemoveDuplicatesRule>,
    #[serde(default)]
    pub sort: Option<SortRule>,
}

impl PlaylistRule {
    pub fn validate(&self) -> Result<(), String> {
        let set = [
            self.merge_channels.is_some(),
            self.remove_duplicates.is_some(),
            self.sort.is_some(),
        ]
        .iter()
        .filter(|v| **v)
        .count();
        if set != 1 {
            return Err("playlist rule must contain exactly one action".to_string());
        }

        if let Some(rule) = &self.merge_channels {
            rule.selector.validate()?;
            if rule.patterns.is_empty() {
                return Err("merge_channels requires at least one pattern".to_string());
            }
            if let Some(fv) = &rule.final_value {
                fv.selector.validate()?;
            }
            if let Some(c) = &rule.condition {
                c.validate()?;
            }
        }
        if let Some(rule) = &self.remove_duplicates {
            rule.selector.validate()?;
            if rule.patterns.is_empty() {
                return Err("remove_duplicates requires at least one pattern".to_string());
            }
            if let Some(fv) = &rule.final_value {
                fv.selector.validate()?;
            }
            if let Some(c) = &rule.condition {
                c.validate()?;
            }
        }
        if let Some(rule) = &self.sort {
            rule.selector.validate()?;
            if let Some(c) = &rule.condition {
                c.validate()?;
            }
        }
        Ok(())
    }

    pub fn condition(&self) -> Option<&Condition> {
        if let Some(r) = &self.merge_channels {
            return r.condition.as_ref();
        }
        if let Some(r) = &self.remove_duplicates {
            return r.condition.as_ref();
        }
        if let Some(r) = &self.sort {
            return r.condition.as_ref();
        }
        None
    }
}
