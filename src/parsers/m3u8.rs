use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

pub const ATTR_TVG_ID: &str = "tvg-id";
pub const ATTR_TVG_LOGO: &str = "tvg-logo";

/// one #EXTINF record: duration and attributes from the header line,
/// auxiliary #TAG:value lines collected since the previous record, and
/// the uri line that follows
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub duration: String,
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub uri: Option<String>,
}

fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([A-Za-z0-9_][A-Za-z0-9_-]*)="([^"]*)""#).unwrap())
}

fn extinf_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#EXTINF:\s*(-?\d+(?:\.\d+)?)").unwrap())
}

/// lazy scanner over one playlist document; malformed records are
/// skipped silently
pub struct M3u8Parser {
    lines: std::vec::IntoIter<String>,
    pending_tags: BTreeMap<String, String>,
}

impl M3u8Parser {
    pub fn new(data: Vec<u8>) -> Self {
        let text = String::from_utf8_lossy(&data).into_owned();
        let lines: Vec<String> = text.lines().map(|l| l.trim().to_string()).collect();
        Self {
            lines: lines.into_iter(),
            pending_tags: BTreeMap::new(),
        }
    }

    pub fn next_track(&mut self) -> Option<Track> {
        while let Some(line) = self.lines.next() {
            if line.is_empty() || line.starts_with("#EXTM3U") {
                continue;
            }

            if let Some(track) = self.try_parse_record(&line) {
                return Some(track);
            }
        }
        None
    }

    fn try_parse_record(&mut self, line: &str) -> Option<Track> {
        if !line.starts_with("#EXTINF:") {
            // arbitrary #KEY:value lines attach to the next track
            if let Some(rest) = line.strip_prefix('#') {
                if let Some((key, value)) = rest.split_once(':') {
                    if !key.is_empty() {
                        self.pending_tags.insert(key.to_string(), value.to_string());
                    }
                }
            }
            return None;
        }

        let duration = match extinf_regex().captures(line) {
            Some(captures) => captures[1].to_string(),
            None => {
                self.pending_tags.clear();
                return None;
            }
        };

        let Some((header, name)) = split_extinf(line) else {
            self.pending_tags.clear();
            return None;
        };

        let mut attributes = BTreeMap::new();
        for captures in attr_regex().captures_iter(header) {
            attributes.insert(captures[1].to_string(), captures[2].to_string());
        }

        // the uri is the next line that is not a comment
        let uri = loop {
            match self.lines.next() {
                Some(next) if next.is_empty() => continue,
                Some(next) if next.starts_with('#') => {
                    // a second header without a uri in between means the
                    // record we were building is malformed, reparse
                    if next.starts_with("#EXTINF:") {
                        self.pending_tags.clear();
                        return self.try_parse_record(&next);
                    }
                    if let Some(rest) = next.strip_prefix('#') {
                        if let Some((key, value)) = rest.split_once(':') {
                            if !key.is_empty() {
                                self.pending_tags.insert(key.to_string(), value.to_string());
                            }
                        }
                    }
                    continue;
                }
                Some(next) => break Some(next),
                None => break None,
            }
        };

        let uri = uri?;

        Some(Track {
            duration,
            name: name.trim().to_string(),
            attributes,
            tags: std::mem::take(&mut self.pending_tags),
            uri: Some(uri),
        })
    }
}

impl Iterator for M3u8Parser {
    type Item = Track;

    fn next(&mut self) -> Option<Track> {
        self.next_track()
    }
}

/// splits an #EXTINF line at the first comma outside double quotes;
/// left side carries duration and attributes, right side is the name
fn split_extinf(line: &str) -> Option<(&str, &str)> {
    let mut in_quotes = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => return Some((&line[..idx], &line[idx + 1..])),
            _ => {}
        }
    }
    None
}

/// serializes merged channels back into one playlist document
pub struct M3u8Writer {
    out: String,
}

impl M3u8Writer {
    pub fn new(epg_url: &str) -> Self {
        let mut out = String::from("#EXTM3U");
        if !epg_url.is_empty() {
            out.push_str(&format!(" x-tvg-url=\"{epg_url}\""));
        }
        out.push('\n');
        Self { out }
    }

    pub fn write_track(&mut self, track: &Track) {
        for (key, value) in &track.tags {
            self.out.push_str(&format!("#{key}:{value}\n"));
        }

        self.out.push_str("#EXTINF:");
        self.out.push_str(&track.duration);
        for (key, value) in &track.attributes {
            self.out.push_str(&format!(" {key}=\"{value}\""));
        }
        self.out.push(',');
        self.out.push_str(&track.name);
        self.out.push('\n');

        if let Some(uri) = &track.uri {
            self.out.push_str(uri);
            self.out.push('\n');
        }
    }

    pub fn finish(self) -> String {
        self.out
    }
}
