use std::collections::HashMap;
use std::sync::Arc;

use crate::config::rules::{
    ChannelRule, Condition, FinalValue, MergeChannelsRule, Pattern, PlaylistRule,
    RemoveDuplicatesRule, Selector, SelectorKind, SortRule,
};
use crate::parsers::m3u8::ATTR_TVG_ID;
use crate::server::services::playlist_services::{Channel, ChannelStore};
use crate::server::utils::template_utils;

/// applies the configured channel rules to every surviving channel, in
/// declaration order; read-only after construction so one processor is
/// shared across all of a client's requests
pub struct ChannelRuleProcessor {
    client_name: String,
    rules: Arc<Vec<ChannelRule>>,
}

impl ChannelRuleProcessor {
    pub fn new(client_name: impl Into<String>, rules: Arc<Vec<ChannelRule>>) -> Self {
        Self {
            client_name: client_name.into(),
            rules,
        }
    }

    pub fn apply(&self, store: &mut ChannelStore) {
        for rule in self.rules.iter() {
            for idx in 0..store.len() {
                if store.get(idx).is_removed() {
                    continue;
                }
                self.apply_rule(rule, store.get_mut(idx));
            }
        }
    }

    fn apply_rule(&self, rule: &ChannelRule, channel: &mut Channel) {
        if let Some(rule) = &rule.set_field {
            if self.matches_opt(channel, rule.condition.as_ref()) {
                let value = template_utils::render(&rule.template, &channel_context(channel, None));
                write_selector(channel, &rule.selector, &value);
            }
        } else if let Some(rule) = &rule.remove_field {
            if self.matches_opt(channel, rule.condition.as_ref()) {
                remove_selector(channel, &rule.selector);
            }
        } else if let Some(rule) = &rule.remove_channel {
            if self.matches_opt(channel, rule.condition.as_ref()) {
                channel.mark_removed();
            }
        } else if let Some(rule) = &rule.mark_hidden {
            if self.matches_opt(channel, rule.condition.as_ref()) {
                channel.mark_hidden();
            }
        }
    }

    fn matches_opt(&self, channel: &Channel, condition: Option<&Condition>) -> bool {
        match condition {
            Some(condition) => matches_condition(&self.client_name, channel, condition),
            None => true,
        }
    }
}

/// group-level rules: merge duplicates, remove duplicates, sort
pub struct PlaylistRuleProcessor {
    client_name: String,
    rules: Arc<Vec<PlaylistRule>>,
}

impl PlaylistRuleProcessor {
    pub fn new(client_name: impl Into<String>, rules: Arc<Vec<PlaylistRule>>) -> Self {
        Self {
            client_name: client_name.into(),
            rules,
        }
    }

    pub fn apply(&self, store: &mut ChannelStore) {
        for rule in self.rules.iter() {
            if let Some(rule) = &rule.merge_channels {
                self.apply_merge(rule, store);
            } else if let Some(rule) = &rule.remove_duplicates {
                self.apply_remove_duplicates(rule, store);
            } else if let Some(rule) = &rule.sort {
                self.apply_sort(rule, store);
            }
        }
    }

    /// groups matching channels by stripped base name and promotes the
    /// best member's tvg-id onto the whole group so the dedup pass later
    /// folds them into one logical channel
    fn apply_merge(&self, rule: &MergeChannelsRule, store: &mut ChannelStore) {
        let groups = self.group_channels(store, &rule.selector, &rule.patterns, rule.condition.as_ref());

        for (base_name, group) in groups {
            if group.len() < 2 {
                continue;
            }
            let best = best_of(store, &group);

            if let Some(id) = store.get(best).attr(ATTR_TVG_ID).map(str::to_string) {
                if !id.is_empty() {
                    for &idx in &group {
                        if idx != best {
                            store.get_mut(idx).set_attr(ATTR_TVG_ID, id.clone());
                        }
                    }
                }
            }

            if let Some(final_value) = &rule.final_value {
                self.assign_final_value(store, &group, best, &base_name, final_value);
            }
        }
    }

    /// like merge, but only the best member survives
    fn apply_remove_duplicates(&self, rule: &RemoveDuplicatesRule, store: &mut ChannelStore) {
        let groups = self.group_channels(store, &rule.selector, &rule.patterns, rule.condition.as_ref());

        for (base_name, group) in groups {
            if group.len() < 2 {
                continue;
            }
            let best = best_of(store, &group);

            for &idx in &group {
                if idx != best {
                    store.get_mut(idx).mark_removed();
                }
            }

            if let Some(final_value) = &rule.final_value {
                self.assign_final_value(store, &[best], best, &base_name, final_value);
            }
        }
    }

    /// stable reorder of the matching subset by the selector value; the
    /// unmatched channels keep their positions
    fn apply_sort(&self, rule: &SortRule, store: &mut ChannelStore) {
        let mut positions = Vec::new();
        for idx in 0..store.len() {
            let channel = store.get(idx);
            if channel.is_removed() {
                continue;
            }
            if let Some(condition) = &rule.condition {
                if !matches_condition(&self.client_name, channel, condition) {
                    continue;
                }
            }
            positions.push(idx);
        }

        let mut keyed: Vec<(String, usize)> = positions
            .iter()
            .map(|&idx| {
                (
                    extract_selector(store.get(idx), &rule.selector).unwrap_or_default(),
                    idx,
                )
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let channels = store.channels_mut();
        let reordered: Vec<Channel> = keyed
            .iter()
            .map(|(_, idx)| channels[*idx].clone())
            .collect();
        for (slot, channel) in positions.into_iter().zip(reordered) {
            channels[slot] = channel;
        }
    }

    fn assign_final_value(
        &self,
        store: &mut ChannelStore,
        targets: &[usize],
        best: usize,
        base_name: &str,
        final_value: &FinalValue,
    ) {
        let context = channel_context(store.get(best), Some(base_name));
        let value = template_utils::render(&final_value.template, &context);
        for &idx in targets {
            write_selector(store.get_mut(idx), &final_value.selector, &value);
        }
    }

    fn group_channels(
        &self,
        store: &ChannelStore,
        selector: &Selector,
        patterns: &[Pattern],
        condition: Option<&Condition>,
    ) -> Vec<(String, Vec<usize>)> {
        let mut order: Vec<String> = Vec::new();
        let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();

        for idx in 0..store.len() {
            let channel = store.get(idx);
            if channel.is_removed() {
                continue;
            }
            if let Some(condition) = condition {
                if !matches_condition(&self.client_name, channel, condition) {
                    continue;
                }
            }
            let Some(value) = extract_selector(channel, selector) else {
                continue;
            };
            for pattern in patterns {
                if pattern.is_match(&value) {
                    let base = pattern.strip(&value);
                    let bucket = buckets.entry(base.clone()).or_default();
                    if bucket.is_empty() {
                        order.push(base);
                    }
                    bucket.push(idx);
                    break;
                }
            }
        }

        order
            .into_iter()
            .map(|base| {
                let group = buckets.remove(&base).unwrap_or_default();
                (base, group)
            })
            .collect()
    }
}

/// lowest priority value wins, declaration order breaks ties
fn best_of(store: &ChannelStore, group: &[usize]) -> usize {
    let mut best = group[0];
    for &idx in &group[1..] {
        if store.get(idx).priority() < store.get(best).priority() {
            best = idx;
        }
    }
    best
}

/// condition evaluation: all present clauses are combined with AND, an
/// absent clause is vacuously true, an empty condition matches
pub fn matches_condition(client_name: &str, channel: &Channel, condition: &Condition) -> bool {
    if !condition.clients.is_empty() && !condition.clients.contains(client_name) {
        return false;
    }

    if !condition.playlists.is_empty() && !condition.playlists.contains(channel.playlist().name())
    {
        return false;
    }

    if let Some(selector) = &condition.selector {
        // a missing attr or tag makes the clause false, not vacuous
        match extract_selector(channel, selector) {
            Some(value) => {
                if !condition.patterns.iter().any(|p| p.is_match(&value)) {
                    return false;
                }
            }
            None => return false,
        }
    }

    if !condition.and.is_empty()
        && !condition
            .and
            .iter()
            .all(|c| matches_condition(client_name, channel, c))
    {
        return false;
    }

    if !condition.or.is_empty()
        && !condition
            .or
            .iter()
            .any(|c| matches_condition(client_name, channel, c))
    {
        return false;
    }

    true
}

pub fn extract_selector(channel: &Channel, selector: &Selector) -> Option<String> {
    match selector.kind {
        SelectorKind::Name => Some(channel.name().to_string()),
        SelectorKind::Attr => selector
            .value
            .as_deref()
            .and_then(|key| channel.attr(key))
            .map(str::to_string),
        SelectorKind::Tag => selector
            .value
            .as_deref()
            .and_then(|key| channel.tag(key))
            .map(str::to_string),
    }
}

fn write_selector(channel: &mut Channel, selector: &Selector, value: &str) {
    match selector.kind {
        SelectorKind::Name => channel.set_name(value),
        SelectorKind::Attr => {
            if let Some(key) = selector.value.clone() {
                channel.set_attr(key, value);
            }
        }
        SelectorKind::Tag => {
            if let Some(key) = selector.value.clone() {
                channel.set_tag(key, value);
            }
        }
    }
}

fn remove_selector(channel: &mut Channel, selector: &Selector) {
    match selector.kind {
        SelectorKind::Name => channel.set_name(""),
        SelectorKind::Attr => {
            if let Some(key) = selector.value.as_deref() {
                channel.remove_attr(key);
            }
        }
        SelectorKind::Tag => {
            if let Some(key) = selector.value.as_deref() {
                channel.remove_tag(key);
            }
        }
    }
}

/// template context for set_field and final_value rendering: the channel
/// name, its source playlist, and every attr/tag under a prefixed key
fn channel_context(channel: &Channel, base_name: Option<&str>) -> HashMap<String, String> {
    let mut context = HashMap::new();
    context.insert("name".to_string(), channel.name().to_string());
    context.insert(
        "playlist".to_string(),
        channel.playlist().name().to_string(),
    );
    if let Some(base_name) = base_name {
        context.insert("base_name".to_string(), base_name.to_string());
    }
    for (key, value) in channel.attrs() {
        context.insert(format!("attr:{key}"), value.clone());
    }
    for (key, value) in channel.tags() {
        context.insert(format!("tag:{key}"), value.clone());
    }
    context
}
