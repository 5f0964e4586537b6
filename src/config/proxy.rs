use serde::{Deserialize, Serialize};

use super::common::{merge_pairs, Duration, HttpClientSettings, NameValue, StringOrList};

/// one proxy block; appears at the server, provider and client levels
/// and later levels override earlier ones field by field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub enabled: Option<bool>,
    #[serde(default)]
    pub concurrency: u32,
    /// how long a stream request may wait for a free permit before it
    /// gets the rate-limit clip; zero means fail immediately
    pub permit_timeout: Option<Duration>,
    #[serde(default)]
    pub http_client: HttpClientSettings,
    #[serde(default)]
    pub stream: HandlerSettings,
    #[serde(default)]
    pub error: ErrorSettings,
}

impl ProxySettings {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    pub fn validate_global(&self) -> Result<(), String> {
        self.http_client
            .validate_global()
            .map_err(|e| format!("http_client: {e}"))
    }

    pub fn validate_override(&self) -> Result<(), String> {
        self.http_client
            .validate_override()
            .map_err(|e| format!("http_client: {e}"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerSettings {
    #[serde(default)]
    pub command: StringOrList,
    #[serde(default)]
    pub env_vars: Vec<NameValue>,
    #[serde(default)]
    pub template_vars: Vec<NameValue>,
}

impl HandlerSettings {
    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSettings {
    /// shared base for the three specific handlers below
    #[serde(default)]
    pub handler: HandlerSettings,
    #[serde(default)]
    pub rate_limit_exceeded: HandlerSettings,
    #[serde(default)]
    pub link_expired: HandlerSettings,
    #[serde(default)]
    pub upstream_error: HandlerSettings,
}

/// folds proxy blocks in order, later non-null fields override earlier
/// ones; template/env vars inside handlers merge key-wise instead of
/// being replaced wholesale
pub fn merge_proxies(proxies: &[&ProxySettings]) -> ProxySettings {
    let mut result = ProxySettings::default();

    for p in proxies {
        if p.enabled.is_some() {
            result.enabled = p.enabled;
        }
        if p.concurrency > 0 {
            result.concurrency = p.concurrency;
        }
        if p.permit_timeout.is_some() {
            result.permit_timeout = p.permit_timeout;
        }

        result.http_client = result.http_client.merged_with(&p.http_client);

        result.stream = merge_handlers(&[&result.stream.clone(), &p.stream]);

        result.error.handler = merge_handlers(&[&result.error.handler.clone(), &p.error.handler]);

        result.error.rate_limit_exceeded = merge_handlers(&[
            &result.error.handler.clone(),
            &result.error.rate_limit_exceeded.clone(),
            &p.error.rate_limit_exceeded,
        ]);
        result.error.link_expired = merge_handlers(&[
            &result.error.handler.clone(),
            &result.error.link_expired.clone(),
            &p.error.link_expired,
        ]);
        result.error.upstream_error = merge_handlers(&[
            &result.error.handler.clone(),
            &result.error.upstream_error.clone(),
            &p.error.upstream_error,
        ]);
    }

    result
}

pub fn merge_handlers(handlers: &[&HandlerSettings]) -> HandlerSettings {
    let mut result = HandlerSettings::default();
    for h in handlers {
        if !h.command.is_empty() {
            result.command = h.command.clone();
        }
        result.template_vars = merge_pairs(&result.template_vars, &h.template_vars);
        result.env_vars = merge_pairs(&result.env_vars, &h.env_vars);
    }
    result
}

/// the built-in proxy block every merge chain starts from: ffmpeg
/// passthrough for streams and an ffmpeg-rendered text clip for errors
pub fn default_proxy() -> ProxySettings {
    let command_vars = vec![NameValue {
        name: "ffmpeg_log_level".to_string(),
        value: "fatal".to_string(),
    }];

    ProxySettings {
        enabled: None,
        concurrency: 0,
        permit_timeout: None,
        http_client: HttpClientSettings::default(),
        stream: HandlerSettings {
            command: vec![
                "ffmpeg",
                "-v",
                "{{ffmpeg_log_level}}",
                "-i",
                "{{url}}",
                "-c",
                "copy",
                "-f",
                "mpegts",
                "pipe:1",
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
            .into(),
            env_vars: Vec::new(),
            template_vars: command_vars.clone(),
        },
        error: ErrorSettings {
            handler: HandlerSettings {
                command: vec![
                    "ffmpeg",
                    "-v",
                    "{{ffmpeg_log_level}}",
                    "-f",
                    "lavfi",
                    "-i",
                    "color=#301934:size=1280x720:rate=1",
                    "-vf",
                    "drawtext=text='{{message}}':fontcolor=white:fontsize=36:x=(w-text_w)/2:y=(h-text_h)/2",
                    "-c:v",
                    "libx264",
                    "-preset",
                    "ultrafast",
                    "-tune",
                    "stillimage",
                    "-g",
                    "1",
                    "-r",
                    "1",
                    "-t",
                    "15",
                    "-pix_fmt",
                    "yuv420p",
                    "-f",
                    "mpegts",
                    "pipe:1",
                ]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
                .into(),
                env_vars: Vec::new(),
                template_vars: command_vars,
            },
            rate_limit_exceeded: HandlerSettings {
                template_vars: vec![NameValue {
                    name: "message".to_string(),
                    value: "Rate limit exceeded\n\nPlease try again later".to_string(),
                }],
                ..Default::default()
            },
            link_expired: HandlerSettings {
                template_vars: vec![NameValue {
                    name: "message".to_string(),
                    value: "Link has expired\n\nPlease refresh your playlist".to_string(),
                }],
                ..Default::default()
            },
            upstream_error: HandlerSettings {
                template_vars: vec![NameValue {
                    name: "message".to_string(),
                    value: "Unable to play stream\n\nPlease try again later".to_string(),
                }],
                ..Default::default()
            },
        },
    }
}
