use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

fn var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.:-]+)\s*\}\}").unwrap())
}

/// substitutes `{{var}}` placeholders from the map; unknown variables
/// render as empty strings so half-configured handlers still run
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    var_regex()
        .replace_all(template, |captures: &regex::Captures| {
            vars.get(&captures[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

pub fn render_all(templates: &[String], vars: &HashMap<String, String>) -> Vec<String> {
    templates.iter().map(|t| render(t, vars)).collect()
}
