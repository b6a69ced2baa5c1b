use crate::error::AppError;
use std::{collections::HashSet, env, path::PathBuf, str::FromStr, time::Duration};
use tracing::{info, warn};

const MB: u64 = 1024 * 1024;

/// Runtime settings, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub admin_ids: HashSet<u64>,
    pub data_dir: PathBuf,
    pub local_bot_api_url: Option<String>,

    /// Transport upload ceiling of the Bot API endpoint.
    pub tg_max_upload_mb: u64,
    /// Internal delivery ceiling applied to every downloaded file.
    pub dl_max_mb: u64,
    /// Ceiling applied to the pre-computed size of a selected video format.
    pub yt_max_mb: u64,

    pub dl_concurrency: usize,
    pub artifact_ttl: Duration,
    pub callback_cache_max: usize,
    pub fileid_cache_max: usize,
    pub stable_fileid_cache_max: usize,

    pub ytdlp: YtDlpSettings,
}

/// Knobs passed through to every yt-dlp invocation.
#[derive(Clone, Debug, Default)]
pub struct YtDlpSettings {
    pub player_clients: Vec<String>,
    pub force_ipv4: bool,
    pub proxy: Option<String>,
    /// Cookie sources in priority order. Each run gets its own copy.
    pub cookies_url: Option<String>,
    pub cookies_text: Option<String>,
    pub cookies_file: Option<PathBuf>,
    pub socket_timeout: Option<u32>,
    pub retries: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_ids: HashSet::new(),
            data_dir: PathBuf::from("."),
            local_bot_api_url: None,
            tg_max_upload_mb: 49,
            dl_max_mb: 130,
            yt_max_mb: 130,
            dl_concurrency: 2,
            artifact_ttl: Duration::from_secs(180 * 24 * 60 * 60),
            callback_cache_max: 3000,
            fileid_cache_max: 15000,
            stable_fileid_cache_max: 5000,
            ytdlp: YtDlpSettings {
                player_clients: vec!["android".into(), "ios".into(), "web".into()],
                ..YtDlpSettings::default()
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let local_bot_api_url = env_string("LOCAL_BOT_API_URL").map(|u| u.trim_end_matches('/').to_string());
        // A local Bot API server lifts the ~50MB cloud upload limit.
        let default_upload = if local_bot_api_url.is_some() { 1900 } else { defaults.tg_max_upload_mb };
        let dl_max_mb = env_parse("DL_MAX_MB", defaults.dl_max_mb)?;

        let ttl_days: u64 = env_parse("FILEID_TTL_DAYS", 180)?;

        let config = Self {
            admin_ids: parse_admin_ids(&env_string("ADMIN_IDS").unwrap_or_default()),
            data_dir: env_string("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            local_bot_api_url,
            tg_max_upload_mb: env_parse("TG_MAX_UPLOAD_MB", default_upload)?,
            dl_max_mb,
            yt_max_mb: env_parse("YT_MAX_MB", dl_max_mb)?,
            dl_concurrency: env_parse::<usize>("DL_CONCURRENCY", defaults.dl_concurrency)?.max(1),
            artifact_ttl: Duration::from_secs(ttl_days.max(1) * 24 * 60 * 60),
            callback_cache_max: env_parse("CALLBACK_CACHE_MAX", defaults.callback_cache_max)?,
            fileid_cache_max: env_parse("FILEID_CACHE_MAX", defaults.fileid_cache_max)?,
            stable_fileid_cache_max: env_parse(
                "YOUTUBE_FILEID_CACHE_MAX",
                defaults.stable_fileid_cache_max,
            )?,
            ytdlp: YtDlpSettings {
                player_clients: env_string("YTDLP_PLAYER_CLIENT")
                    .map(|raw| split_list(&raw))
                    .unwrap_or(defaults.ytdlp.player_clients),
                force_ipv4: matches!(
                    env_string("YTDLP_FORCE_IPV4").as_deref(),
                    Some("1") | Some("true") | Some("TRUE")
                ),
                proxy: env_string("YTDLP_PROXY").and_then(|raw| {
                    let proxy = normalize_proxy(&raw);
                    if proxy.is_none() {
                        warn!(event = "proxy_ignored", raw = %raw, "YTDLP_PROXY is malformed and was ignored");
                    }
                    proxy
                }),
                cookies_url: env_string("YT_COOKIES_URL"),
                cookies_text: env::var("YT_COOKIES_TEXT").ok().filter(|t| !t.trim().is_empty()),
                cookies_file: env_string("YTDLP_COOKIES_FILE")
                    .or_else(|| env_string("YT_COOKIES_FILE"))
                    .map(PathBuf::from),
                socket_timeout: env_optional("YTDLP_SOCKET_TIMEOUT")?,
                retries: env_optional("YTDLP_RETRIES")?,
            },
        };

        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        info!(
            event = "config_loaded",
            dl_max_mb = config.dl_max_mb,
            tg_max_upload_mb = config.tg_max_upload_mb,
            dl_concurrency = config.dl_concurrency,
            admins = config.admin_ids.len(),
            local_api = config.local_bot_api_url.is_some()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.callback_cache_max < 2 {
            return Err(AppError::Config("CALLBACK_CACHE_MAX must be at least 2".into()));
        }
        if self.fileid_cache_max == 0 || self.stable_fileid_cache_max == 0 {
            return Err(AppError::Config("file_id cache sizes must be greater than 0".into()));
        }
        if let Some(url) = &self.local_bot_api_url {
            url::Url::parse(url)
                .map_err(|e| AppError::Config(format!("LOCAL_BOT_API_URL is invalid: {e}")))?;
        }
        Ok(())
    }

    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_ids.contains(&user_id)
    }

    pub fn dl_max_bytes(&self) -> u64 {
        self.dl_max_mb * MB
    }

    pub fn tg_max_upload_bytes(&self) -> u64 {
        self.tg_max_upload_mb * MB
    }

    pub fn yt_max_bytes(&self) -> u64 {
        self.yt_max_mb * MB
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| AppError::Config(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
}

fn env_optional<T: FromStr>(key: &str) -> Result<Option<T>, AppError>
where
    T::Err: std::fmt::Display,
{
    env_string(key)
        .map(|raw| {
            raw.parse()
                .map_err(|e| AppError::Config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

fn parse_admin_ids(raw: &str) -> HashSet<u64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Accepts `http(s)://` and `socks5(h)://` proxies with an explicit host and port.
pub fn normalize_proxy(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let parsed = url::Url::parse(&candidate).ok()?;
    if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
        return None;
    }
    parsed.host_str()?;
    parsed.port()?;
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_ids_skip_garbage() {
        let ids = parse_admin_ids("123, abc,456,,");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&123) && ids.contains(&456));
    }

    #[test]
    fn proxy_requires_host_and_port() {
        assert_eq!(
            normalize_proxy("user:pw@10.0.0.1:8080").as_deref(),
            Some("http://user:pw@10.0.0.1:8080")
        );
        assert_eq!(
            normalize_proxy("socks5://127.0.0.1:1080").as_deref(),
            Some("socks5://127.0.0.1:1080")
        );
        assert_eq!(normalize_proxy("ftp://host:21"), None);
        assert_eq!(normalize_proxy("http://host"), None);
    }

    #[test]
    fn default_limits_match_cloud_bot_api() {
        let config = Config::default();
        assert_eq!(config.dl_max_bytes(), 130 * MB);
        assert_eq!(config.tg_max_upload_bytes(), 49 * MB);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn player_clients_accept_commas_and_spaces() {
        assert_eq!(split_list("android, ios web"), vec!["android", "ios", "web"]);
    }
}
