use crate::{
    config::YtDlpSettings,
    error::{ExtractError, PipelineError, ToolError},
    formats::MediaInfo,
    normalize::{is_tiktok_photo, strip_query, tiktok_photo_to_video},
    tokens::DeliveryKind,
    tools,
};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(120);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const OUTPUT_TEMPLATE: &str = "%(title).200s.%(ext)s";
/// Cap used when a height choice cannot be parsed.
const FALLBACK_HEIGHT_CAP: u32 = 720;
const COOKIES_PREFIX: &str = "yt_cookies_";
const COOKIES_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How the backend should pick streams, as an ordered list of fallbacks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamSelector {
    /// A specific stream id; `has_audio` tells whether it needs an audio companion.
    Exact { id: String, has_audio: bool },
    /// Best streams no taller than the given height.
    HeightCap(u32),
    Best,
    BestAudio,
}

impl StreamSelector {
    /// `format_id` is either a stream id or `h:<height>`.
    pub fn for_request(kind: DeliveryKind, format_id: Option<&str>, has_audio: Option<bool>) -> Self {
        if kind.is_audio() {
            return Self::BestAudio;
        }
        match format_id.map(str::trim).filter(|f| !f.is_empty()) {
            Some(raw) => match raw.strip_prefix("h:").map(str::parse::<u32>) {
                Some(Ok(height)) => Self::HeightCap(height),
                Some(Err(_)) => Self::HeightCap(FALLBACK_HEIGHT_CAP),
                None => Self::Exact {
                    id: raw.to_string(),
                    has_audio: has_audio.unwrap_or(false),
                },
            },
            None => Self::Best,
        }
    }

    pub fn strategies(&self) -> Vec<String> {
        match self {
            Self::Exact { id, has_audio: true } => vec![id.clone()],
            Self::Exact { id, has_audio: false } => {
                vec![format!("{id}+bestaudio[ext=m4a]"), format!("{id}+bestaudio")]
            }
            Self::HeightCap(h) => vec![
                format!("bestvideo*[height<={h}][ext=mp4]+bestaudio[ext=m4a]"),
                format!("bestvideo*[height<={h}]+bestaudio"),
                format!("best[height<={h}][ext=mp4]"),
                format!("best[height<={h}]"),
            ],
            Self::Best => vec!["bestvideo*+bestaudio".into(), "best".into()],
            Self::BestAudio => vec!["bestaudio".into(), "best".into()],
        }
    }

    /// The `-f` argument: strategies joined in preference order.
    pub fn format_spec(&self) -> String {
        self.strategies().join("/")
    }
}

/// One fetch, owned by a single pipeline run.
#[derive(Clone, Debug)]
pub struct DownloadJob {
    pub url: String,
    pub kind: DeliveryKind,
    pub selector: StreamSelector,
    pub workdir: PathBuf,
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn resolve_metadata(&self, url: &str) -> Result<MediaInfo, ExtractError>;
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetches the job's media into its working directory and returns the
    /// path of the deliverable file.
    async fn download(&self, job: &DownloadJob) -> Result<PathBuf, PipelineError>;
}

#[derive(Clone, Debug, Default)]
pub struct YtDlpClient {
    settings: YtDlpSettings,
    http: reqwest::Client,
}

impl YtDlpClient {
    pub fn new(settings: YtDlpSettings, http: reqwest::Client) -> Self {
        Self { settings, http }
    }

    /// A ready command plus the cookies copy it points at. Keep the copy alive
    /// until the process exits; it is deleted on drop.
    async fn command(&self, dir: &Path) -> (Command, Option<NamedTempFile>) {
        let cookies = self.prepare_cookies(dir).await;
        let cmd = self.base_command(cookies.as_ref().map(|file| file.path()));
        (cmd, cookies)
    }

    fn base_command(&self, cookies: Option<&Path>) -> Command {
        let mut cmd = Command::new("yt-dlp");
        cmd.arg("--no-playlist").arg("--no-warnings");
        if !self.settings.player_clients.is_empty() {
            cmd.arg("--extractor-args").arg(format!(
                "youtube:player_client={}",
                self.settings.player_clients.join(",")
            ));
        }
        if self.settings.force_ipv4 {
            cmd.arg("--force-ipv4");
        }
        if let Some(proxy) = &self.settings.proxy {
            cmd.arg("--proxy").arg(proxy);
        }
        if let Some(cookies) = cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        if let Some(timeout) = self.settings.socket_timeout {
            cmd.arg("--socket-timeout").arg(timeout.to_string());
        }
        if let Some(retries) = self.settings.retries {
            cmd.arg("--retries").arg(retries.to_string());
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        debug!(event = "yt_dlp_command_ready");
        cmd
    }

    /// yt-dlp rewrites its cookies file on exit, so concurrent runs must never
    /// share one. Sources are tried in order: URL, inline text, file.
    async fn prepare_cookies(&self, dir: &Path) -> Option<NamedTempFile> {
        let content = self.cookies_content().await?;
        match write_cookies(dir, &content).await {
            Ok(file) => {
                debug!(event = "cookies_ready", path = %file.path().display());
                Some(file)
            }
            Err(err) => {
                warn!(event = "cookies_write_failed", dir = %dir.display(), error = %err);
                None
            }
        }
    }

    async fn cookies_content(&self) -> Option<String> {
        if let Some(url) = &self.settings.cookies_url {
            match self.fetch_cookies(url).await {
                Ok(raw) => return Some(decode_cookies(&raw)),
                Err(err) => warn!(event = "cookies_url_failed", error = %err),
            }
        }
        if let Some(text) = &self.settings.cookies_text {
            return Some(unescape_newlines(text));
        }
        let path = self.settings.cookies_file.as_ref()?;
        match tokio::fs::read(path).await {
            Ok(raw) if !raw.is_empty() => Some(decode_cookies(&raw)),
            Ok(_) => {
                warn!(event = "cookies_file_empty", path = %path.display());
                None
            }
            Err(err) => {
                warn!(event = "cookies_file_unreadable", path = %path.display(), error = %err);
                None
            }
        }
    }

    async fn fetch_cookies(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self
            .http
            .get(url)
            .timeout(COOKIES_FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn run(&self, mut cmd: Command, limit: Duration) -> Result<Vec<u8>, ExtractError> {
        let child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExtractError::Failed(format!("failed to start yt-dlp: {e}")))?;
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ExtractError::Timeout)?
            .map_err(|e| ExtractError::Failed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(event = "yt_dlp_failed", status = %output.status, stderr = %stderr.trim());
            return Err(ExtractError::classify(&stderr));
        }
        Ok(output.stdout)
    }

    #[instrument(skip(self, workdir))]
    async fn download_video(
        &self,
        url: &str,
        selector: &StreamSelector,
        workdir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let spec = selector.format_spec();
        info!(event = "download_video_start", format = %spec);
        let (mut cmd, _cookies) = self.command(workdir).await;
        cmd.arg("-f")
            .arg(&spec)
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("-o")
            .arg(workdir.join(OUTPUT_TEMPLATE))
            .arg(url);
        self.run(cmd, DOWNLOAD_TIMEOUT).await?;
        find_output(workdir).await
    }

    /// MP3 at 192k through yt-dlp's ffmpeg post-processor; when conversion
    /// fails, the raw best-audio stream is delivered instead.
    #[instrument(skip(self, workdir))]
    async fn download_audio(&self, url: &str, workdir: &Path) -> Result<PathBuf, PipelineError> {
        let spec = StreamSelector::BestAudio.format_spec();
        let (mut cmd, _cookies) = self.command(workdir).await;
        cmd.arg("-f")
            .arg(&spec)
            .args(["-x", "--audio-format", "mp3", "--audio-quality", "192K"])
            .arg("-o")
            .arg(workdir.join(OUTPUT_TEMPLATE))
            .arg(url);
        match self.run(cmd, DOWNLOAD_TIMEOUT).await {
            Ok(_) => return find_output(workdir).await,
            Err(ExtractError::Failed(reason)) => {
                warn!(event = "audio_convert_failed", reason = %reason, "falling back to raw stream");
            }
            Err(other) => return Err(other.into()),
        }

        clear_dir(workdir).await?;
        let (mut cmd, _cookies) = self.command(workdir).await;
        cmd.arg("-f")
            .arg(&spec)
            .arg("-o")
            .arg(workdir.join(OUTPUT_TEMPLATE))
            .arg(url);
        self.run(cmd, DOWNLOAD_TIMEOUT).await?;
        find_output(workdir).await
    }

    /// Photo posts: the `/video/` variant first, then the clean URL, then
    /// gallery-dl with ffmpeg.
    #[instrument(skip(self, workdir))]
    async fn download_photo_audio(&self, url: &str, workdir: &Path) -> Result<PathBuf, PipelineError> {
        let clean = strip_query(url);
        let mut candidates = vec![tiktok_photo_to_video(&clean)];
        if !candidates.contains(&clean) {
            candidates.push(clean.clone());
        }

        for (attempt, candidate) in candidates.iter().enumerate() {
            let attempt_dir = workdir.join(format!("try{attempt}"));
            tokio::fs::create_dir_all(&attempt_dir).await?;
            match self.download_audio(candidate, &attempt_dir).await {
                Ok(path) => return Ok(path),
                Err(err) => warn!(event = "photo_audio_attempt_failed", url = %candidate, error = %err),
            }
        }

        Ok(tools::photo_audio_from_gallery(&clean, workdir).await?)
    }
}

#[async_trait]
impl MediaProvider for YtDlpClient {
    #[instrument(skip(self))]
    async fn resolve_metadata(&self, url: &str) -> Result<MediaInfo, ExtractError> {
        info!(event = "fetch_formats_start", url = %url);
        let (mut cmd, _cookies) = self.command(&std::env::temp_dir()).await;
        cmd.arg("-J").arg(url);
        let stdout = self.run(cmd, METADATA_TIMEOUT).await?;

        let info: MediaInfo = serde_json::from_slice(&stdout)
            .map_err(|e| ExtractError::Failed(format!("invalid yt-dlp JSON: {e}")))?;
        info!(event = "fetch_formats_success", format_count = info.formats.len());
        Ok(info)
    }
}

#[async_trait]
impl Downloader for YtDlpClient {
    #[instrument(skip(self, job), fields(url = %job.url, kind = job.kind.as_str()))]
    async fn download(&self, job: &DownloadJob) -> Result<PathBuf, PipelineError> {
        match job.kind {
            DeliveryKind::Video => self.download_video(&job.url, &job.selector, &job.workdir).await,
            DeliveryKind::Audio => self.download_audio(&job.url, &job.workdir).await,
            DeliveryKind::PhotoAudio if is_tiktok_photo(&job.url) => {
                self.download_photo_audio(&job.url, &job.workdir).await
            }
            DeliveryKind::PhotoAudio => self.download_audio(&job.url, &job.workdir).await,
            DeliveryKind::PhotoBundle => {
                Ok(tools::bundle_photos(&strip_query(&job.url), &job.workdir).await?)
            }
        }
    }
}

/// The finished file yt-dlp left in `dir`: the largest one that is not a
/// partial or sidecar file.
async fn find_output(dir: &Path) -> Result<PathBuf, PipelineError> {
    let files = tools::collect_files(dir)
        .await
        .into_iter()
        .filter(|p| !is_partial(p));
    tools::largest_file(files)
        .ok_or_else(|| ToolError::NoOutput(format!("nothing downloaded into {}", dir.display())).into())
}

fn is_partial(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("part" | "ytdl" | "temp" | "json")
    ) || path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.contains(".part-Frag") || n.starts_with(COOKIES_PREFIX))
        .unwrap_or(false)
}

async fn write_cookies(dir: &Path, content: &str) -> std::io::Result<NamedTempFile> {
    tokio::fs::create_dir_all(dir).await?;
    let file = tempfile::Builder::new()
        .prefix(COOKIES_PREFIX)
        .suffix(".txt")
        .tempfile_in(dir)?;
    let content = content.replace("\r\n", "\n").replace('\r', "\n");
    let head = content.trim_start();
    if !head.starts_with("# Netscape") && !head.starts_with("# HTTP Cookie File") {
        warn!(event = "cookies_format_suspicious", "cookies do not start with a Netscape header");
    }
    tokio::fs::write(file.path(), content).await?;
    Ok(file)
}

/// yt-dlp reads cookies as UTF-8. UTF-16 exports carrying a BOM are decoded
/// as such; other non-UTF-8 input is read as Latin-1.
fn decode_cookies(raw: &[u8]) -> String {
    match raw {
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes),
        _ => match std::str::from_utf8(raw) {
            Ok(text) => text.to_string(),
            Err(_) => raw.iter().copied().map(char::from).collect(),
        },
    }
}

fn decode_utf16(raw: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = raw.chunks_exact(2).map(|pair| unit([pair[0], pair[1]])).collect();
    String::from_utf16_lossy(&units)
}

/// Env UIs often store a multi-line value with literal `\n` escapes.
fn unescape_newlines(text: &str) -> String {
    if text.contains("\\n") && !text.contains('\n') {
        text.replace("\\r\\n", "\n").replace("\\n", "\n")
    } else {
        text.to_string()
    }
}

async fn clear_dir(dir: &Path) -> std::io::Result<()> {
    for path in tools::collect_files(dir).await {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}
