//! Drives one button press from token lookup to delivered media.
//!
//! ```text
//! PendingSelection -> Resolving -> CacheCheck -+-> SendingCached -------------------------------+-> Done
//!                                              +-> Scheduled -> Downloading -> SizeCheck         |
//!                                                   -> Sending -> CachePopulate ----------------+
//! any step -> Failed
//! ```
//!
//! A cached reference the channel rejects is evicted and the run continues as
//! a miss. Two concurrent misses for the same key both download.

use crate::{
    artifact_cache::ArtifactCache,
    backend::{DownloadJob, Downloader, StreamSelector},
    config::Config,
    error::{PipelineError, SendError},
    i18n::{describe_error, text, Lang, Text},
    jobs::{JobGuard, JobRegistry},
    messenger::{DeliveryRef, MediaSource, Messenger, ReplyTarget},
    normalize::artifact_key,
    scheduler::DownloadScheduler,
    tokens::{DeliveryKind, ResolvedRequest, SelectionToken, SelectionTokenStore},
};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, instrument, warn};

const MB: u64 = 1024 * 1024;
const SEND_ATTEMPTS: usize = 2;
const SEND_RETRY_DELAY: Duration = Duration::from_secs(2);
const CAPTION_TITLE_CHARS: usize = 200;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PipelineState {
    PendingSelection,
    Resolving,
    CacheCheck,
    SendingCached,
    Scheduled,
    Downloading,
    SizeCheck,
    Sending,
    CachePopulate,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingSelection => "pending_selection",
            Self::Resolving => "resolving",
            Self::CacheCheck => "cache_check",
            Self::SendingCached => "sending_cached",
            Self::Scheduled => "scheduled",
            Self::Downloading => "downloading",
            Self::SizeCheck => "size_check",
            Self::Sending => "sending",
            Self::CachePopulate => "cache_populate",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryOutcome {
    /// Re-sent from a cached reference; nothing was downloaded.
    Cached,
    Downloaded,
}

#[derive(Clone, Copy, Debug)]
pub struct SizeLimits {
    /// Internal ceiling for any downloaded file.
    pub dl_max_bytes: u64,
    /// What the messaging transport accepts.
    pub upload_max_bytes: u64,
    /// Ceiling for the pre-computed size of a chosen video format.
    pub selection_max_bytes: u64,
}

impl SizeLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dl_max_bytes: config.dl_max_bytes(),
            upload_max_bytes: config.tg_max_upload_bytes(),
            selection_max_bytes: config.yt_max_bytes(),
        }
    }
}

fn mb_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(MB)
}

pub struct DeliveryPipeline {
    tokens: Arc<SelectionTokenStore>,
    general_cache: Arc<ArtifactCache>,
    stable_cache: Arc<ArtifactCache>,
    scheduler: DownloadScheduler,
    downloader: Arc<dyn Downloader>,
    messenger: Arc<dyn Messenger>,
    jobs: JobRegistry,
    limits: SizeLimits,
}

impl DeliveryPipeline {
    pub fn new(config: &Config, downloader: Arc<dyn Downloader>, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            tokens: Arc::new(SelectionTokenStore::new(config.callback_cache_max)),
            general_cache: Arc::new(ArtifactCache::new(
                "general",
                config.artifact_ttl,
                config.fileid_cache_max,
            )),
            stable_cache: Arc::new(ArtifactCache::new(
                "stable",
                config.artifact_ttl,
                config.stable_fileid_cache_max,
            )),
            scheduler: DownloadScheduler::new(config.dl_concurrency),
            downloader,
            messenger,
            jobs: JobRegistry::new(),
            limits: SizeLimits::from_config(config),
        }
    }

    pub fn tokens(&self) -> &SelectionTokenStore {
        &self.tokens
    }

    pub fn caches(&self) -> [&ArtifactCache; 2] {
        [self.general_cache.as_ref(), self.stable_cache.as_ref()]
    }

    pub fn scheduler(&self) -> &DownloadScheduler {
        &self.scheduler
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn resolve(&self, token: &SelectionToken) -> Result<ResolvedRequest, PipelineError> {
        self.tokens.get(token).ok_or(PipelineError::ExpiredSelection)
    }

    /// Rejects a video choice whose known size is already over the limit, so
    /// nothing gets downloaded for it.
    pub fn precheck(&self, request: &ResolvedRequest) -> Result<(), PipelineError> {
        if request.kind != DeliveryKind::Video {
            return Ok(());
        }
        match request.total_bytes {
            Some(total) if total > self.limits.selection_max_bytes => Err(PipelineError::TooLarge {
                size_mb: mb_ceil(total),
                max_mb: self.limits.selection_max_bytes / MB,
            }),
            _ => Ok(()),
        }
    }

    /// Full run for one token. On failure the user gets exactly one localized
    /// notice at `origin`, or at the request's own reply target once known.
    #[instrument(skip(self, token), fields(token = %token))]
    pub async fn run(
        &self,
        token: &SelectionToken,
        origin: ReplyTarget,
        lang: Lang,
    ) -> Result<DeliveryOutcome, PipelineError> {
        let request = match self.resolve(token) {
            Ok(request) => request,
            Err(err) => {
                warn!(event = "selection_expired");
                self.notify_failure(origin, lang, &err).await;
                return Err(err);
            }
        };

        let status = self
            .messenger
            .send_text(request.reply_to, text(request.lang, Text::DownloadingWait))
            .await
            .map_err(|err| warn!(event = "status_message_failed", error = %err))
            .ok();

        let result = self.deliver(&request).await;

        if let Some(message_id) = status {
            if let Err(err) = self
                .messenger
                .delete_message(request.reply_to.chat_id, message_id)
                .await
            {
                warn!(event = "status_delete_failed", error = %err);
            }
        }
        if let Err(err) = &result {
            self.notify_failure(request.reply_to, request.lang, err).await;
        }
        result
    }

    /// Delivers an already-resolved request. No user notification.
    #[instrument(skip(self, request), fields(url = %request.url, kind = request.kind.as_str()))]
    pub async fn deliver(&self, request: &ResolvedRequest) -> Result<DeliveryOutcome, PipelineError> {
        let job = self.jobs.start(&request.url, request.kind);
        job.set_state(PipelineState::Resolving);
        let result = self.deliver_steps(request, &job).await;
        match &result {
            Ok(outcome) => {
                job.set_state(PipelineState::Done);
                info!(event = "delivery_done", outcome = ?outcome);
            }
            Err(PipelineError::Extract(extract)) if extract.needs_verification() => {
                job.set_state(PipelineState::Failed);
                error!(event = "delivery_blocked", error = %extract, "backend needs fresh cookies or another IP");
            }
            Err(err) => {
                job.set_state(PipelineState::Failed);
                warn!(event = "delivery_failed", error = %err);
            }
        }
        result
    }

    async fn deliver_steps(
        &self,
        request: &ResolvedRequest,
        job: &JobGuard,
    ) -> Result<DeliveryOutcome, PipelineError> {
        self.precheck(request)?;

        let selector = StreamSelector::for_request(
            request.kind,
            request.format_id.as_deref(),
            request.has_audio,
        );
        let general_key = artifact_key(&request.url, request.kind, request.format_id.as_deref(), None);
        let stable_key = request
            .stable_key
            .as_deref()
            .map(|stable| artifact_key(&request.url, request.kind, None, Some(stable)));
        let caption = self.caption(request);

        job.set_state(PipelineState::CacheCheck);
        let lookups = [
            (&self.stable_cache, stable_key.as_deref()),
            (&self.general_cache, Some(general_key.as_str())),
        ];
        for (cache, key) in lookups {
            let Some(key) = key else { continue };
            let Some(reference) = cache.get(key) else { continue };
            info!(event = "artifact_cache_hit", cache = cache.name(), key = %key);
            job.set_state(PipelineState::SendingCached);
            let source = MediaSource::Reference(reference.0);
            match self.send_with_retry(request.reply_to, request.kind, &source, &caption).await {
                Ok(_) => return Ok(DeliveryOutcome::Cached),
                Err(err) => {
                    warn!(event = "stale_reference_evicted", cache = cache.name(), key = %key, error = %err);
                    cache.remove(key);
                    job.set_state(PipelineState::CacheCheck);
                }
            }
        }

        job.set_state(PipelineState::Scheduled);
        let permit = self.scheduler.acquire().await;

        job.set_state(PipelineState::Downloading);
        let workdir = tempfile::Builder::new().prefix("dlbot_").tempdir()?;
        let path = self
            .downloader
            .download(&DownloadJob {
                url: request.url.clone(),
                kind: request.kind,
                selector,
                workdir: workdir.path().to_path_buf(),
            })
            .await?;

        job.set_state(PipelineState::SizeCheck);
        let size = tokio::fs::metadata(&path).await?.len();
        drop(permit);
        self.check_size(size)?;

        job.set_state(PipelineState::Sending);
        let delivered = self
            .send_with_retry(request.reply_to, request.kind, &MediaSource::File(path), &caption)
            .await?;

        job.set_state(PipelineState::CachePopulate);
        if let Some(reference) = delivered {
            self.general_cache.put(general_key, reference.clone());
            if let Some(key) = stable_key {
                self.stable_cache.put(key, reference);
            }
        }
        Ok(DeliveryOutcome::Downloaded)
    }

    fn check_size(&self, size: u64) -> Result<(), PipelineError> {
        if size > self.limits.dl_max_bytes {
            return Err(PipelineError::TooLarge {
                size_mb: mb_ceil(size),
                max_mb: self.limits.dl_max_bytes / MB,
            });
        }
        if size > self.limits.upload_max_bytes {
            return Err(PipelineError::UploadLimit {
                size_mb: size as f64 / MB as f64,
                max_mb: self.limits.upload_max_bytes / MB,
            });
        }
        Ok(())
    }

    /// Retries only transport timeouts.
    async fn send_with_retry(
        &self,
        target: ReplyTarget,
        kind: DeliveryKind,
        source: &MediaSource,
        caption: &str,
    ) -> Result<Option<DeliveryRef>, SendError> {
        let mut attempt = 1;
        loop {
            match self.messenger.send_media(target, kind, source, caption).await {
                Ok(reference) => return Ok(reference),
                Err(err) if err.is_timeout() && attempt < SEND_ATTEMPTS => {
                    warn!(event = "send_retry", attempt, delay = ?SEND_RETRY_DELAY, error = %err);
                    tokio::time::sleep(SEND_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn notify_failure(&self, target: ReplyTarget, lang: Lang, err: &PipelineError) {
        let message = describe_error(err, lang);
        if let Err(send_err) = self.messenger.send_text(target, &message).await {
            warn!(event = "failure_notice_failed", error = %send_err);
        }
    }

    fn caption(&self, request: &ResolvedRequest) -> String {
        let suffix = text(request.lang, Text::CaptionSuffix);
        match request.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(title) => {
                let title: String = title.chars().take(CAPTION_TITLE_CHARS).collect();
                format!("{title}\n\n{suffix}")
            }
            None => suffix.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::{
        collections::HashSet,
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering},
    };

    struct FakeDownloader {
        size: u64,
        calls: AtomicUsize,
        workdirs: Mutex<Vec<PathBuf>>,
    }

    impl FakeDownloader {
        fn new(size: u64) -> Arc<Self> {
            Arc::new(Self {
                size,
                calls: AtomicUsize::new(0),
                workdirs: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Downloader for FakeDownloader {
        async fn download(&self, job: &DownloadJob) -> Result<PathBuf, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.workdirs.lock().push(job.workdir.clone());
            let path = job.workdir.join("clip.mp4");
            let file = tokio::fs::File::create(&path).await?;
            file.set_len(self.size).await?;
            Ok(path)
        }
    }

    #[derive(Default)]
    struct FakeMessenger {
        sent: Mutex<Vec<(DeliveryKind, MediaSource)>>,
        texts: Mutex<Vec<String>>,
        text_targets: Mutex<Vec<ReplyTarget>>,
        deleted: Mutex<Vec<i32>>,
        timeouts_left: AtomicUsize,
        stale_refs: HashSet<String>,
        media_attempts: AtomicUsize,
    }

    impl FakeMessenger {
        fn sent(&self) -> Vec<(DeliveryKind, MediaSource)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        async fn send_media(
            &self,
            _target: ReplyTarget,
            kind: DeliveryKind,
            source: &MediaSource,
            _caption: &str,
        ) -> Result<Option<DeliveryRef>, SendError> {
            let attempt = self.media_attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .timeouts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SendError::Timeout);
            }
            if let MediaSource::Reference(id) = source {
                if self.stale_refs.contains(id) {
                    return Err(SendError::Other("Bad Request: wrong file identifier".into()));
                }
            }
            self.sent.lock().push((kind, source.clone()));
            Ok(Some(DeliveryRef(format!("ref-{attempt}"))))
        }

        async fn send_text(&self, target: ReplyTarget, text: &str) -> Result<i32, SendError> {
            self.text_targets.lock().push(target);
            let mut texts = self.texts.lock();
            texts.push(text.to_string());
            Ok(texts.len() as i32)
        }

        async fn delete_message(&self, _chat_id: i64, message_id: i32) -> Result<(), SendError> {
            self.deleted.lock().push(message_id);
            Ok(())
        }
    }

    fn pipeline(downloader: Arc<FakeDownloader>, messenger: Arc<FakeMessenger>) -> DeliveryPipeline {
        DeliveryPipeline::new(&Config::default(), downloader, messenger)
    }

    fn video_request() -> ResolvedRequest {
        let mut request = ResolvedRequest::new(
            "https://youtu.be/abc?si=x",
            DeliveryKind::Video,
            ReplyTarget::new(100, Some(5)),
            Lang::Uz,
        );
        request.format_id = Some("136".into());
        request.has_audio = Some(false);
        request.stable_key = Some("yt:abc:720p".into());
        request.title = Some("Clip".into());
        request
    }

    #[tokio::test]
    async fn miss_downloads_then_hit_skips_download() {
        let downloader = FakeDownloader::new(40 * MB);
        let messenger = Arc::new(FakeMessenger::default());
        let pipeline = pipeline(downloader.clone(), messenger.clone());
        let token = pipeline.tokens().put(video_request());
        let origin = ReplyTarget::new(100, None);

        let first = pipeline.run(&token, origin, Lang::Uz).await.unwrap();
        assert_eq!(first, DeliveryOutcome::Downloaded);
        assert_eq!(downloader.calls(), 1);
        assert_eq!(
            pipeline.general_cache.get("u:https://www.youtube.com/watch?v=abc:video:136"),
            Some(DeliveryRef("ref-0".into()))
        );
        assert_eq!(
            pipeline.stable_cache.get("yt:abc:720p:video"),
            Some(DeliveryRef("ref-0".into()))
        );

        let second = pipeline.run(&token, origin, Lang::Uz).await.unwrap();
        assert_eq!(second, DeliveryOutcome::Cached);
        assert_eq!(downloader.calls(), 1);
        assert_eq!(
            messenger.sent().last().map(|(_, s)| s.clone()),
            Some(MediaSource::Reference("ref-0".into()))
        );

        for dir in downloader.workdirs.lock().iter() {
            assert!(!dir.exists(), "working directory {} was left behind", dir.display());
        }
        // One status message per run, each replying to the link and deleted afterwards.
        assert_eq!(*messenger.deleted.lock(), vec![1, 2]);
        assert_eq!(messenger.text_targets.lock()[0], ReplyTarget::new(100, Some(5)));
        assert!(pipeline.jobs().is_empty());
    }

    #[tokio::test]
    async fn oversized_download_aborts_before_sending() {
        let downloader = FakeDownloader::new(300 * MB);
        let messenger = Arc::new(FakeMessenger::default());
        let pipeline = pipeline(downloader.clone(), messenger.clone());
        let token = pipeline.tokens().put(video_request());

        let err = pipeline
            .run(&token, ReplyTarget::new(100, None), Lang::Uz)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TooLarge { size_mb: 300, max_mb: 130 }));
        assert!(messenger.sent().is_empty());
        assert!(pipeline.general_cache.is_empty());
        assert!(pipeline.stable_cache.is_empty());

        let texts = messenger.texts.lock().clone();
        assert_eq!(texts.len(), 2, "status message plus one failure notice");
        assert!(texts[1].contains("300MB"));
    }

    #[tokio::test]
    async fn upload_limit_is_checked_after_internal_limit() {
        let downloader = FakeDownloader::new(60 * MB);
        let messenger = Arc::new(FakeMessenger::default());
        let pipeline = pipeline(downloader, messenger.clone());

        let err = pipeline.deliver(&video_request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::UploadLimit { max_mb: 49, .. }));
        assert!(messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn precomputed_size_is_rejected_without_download() {
        let downloader = FakeDownloader::new(MB);
        let messenger = Arc::new(FakeMessenger::default());
        let pipeline = pipeline(downloader.clone(), messenger);
        let mut request = video_request();
        request.total_bytes = Some(300 * MB);

        let err = pipeline.deliver(&request).await.unwrap_err();
        assert!(matches!(err, PipelineError::TooLarge { size_mb: 300, max_mb: 130 }));
        assert_eq!(downloader.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_timeout_is_retried_once() {
        let downloader = FakeDownloader::new(10 * MB);
        let messenger = Arc::new(FakeMessenger {
            timeouts_left: AtomicUsize::new(1),
            ..FakeMessenger::default()
        });
        let pipeline = pipeline(downloader, messenger.clone());

        let outcome = pipeline.deliver(&video_request()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Downloaded);
        assert_eq!(messenger.media_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(messenger.sent().len(), 1);
        assert_eq!(pipeline.general_cache.len(), 1);
        assert_eq!(pipeline.stable_cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timeouts_fail_without_cache_write() {
        let downloader = FakeDownloader::new(10 * MB);
        let messenger = Arc::new(FakeMessenger {
            timeouts_left: AtomicUsize::new(5),
            ..FakeMessenger::default()
        });
        let pipeline = pipeline(downloader, messenger.clone());

        let err = pipeline.deliver(&video_request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Send(SendError::Timeout)));
        assert_eq!(messenger.media_attempts.load(Ordering::SeqCst), SEND_ATTEMPTS);
        assert!(pipeline.general_cache.is_empty());
    }

    #[tokio::test]
    async fn stale_reference_demotes_to_miss() {
        let downloader = FakeDownloader::new(MB);
        let messenger = Arc::new(FakeMessenger {
            stale_refs: HashSet::from(["old-ref".to_string()]),
            ..FakeMessenger::default()
        });
        let pipeline = pipeline(downloader.clone(), messenger.clone());
        let request = video_request();
        let key = artifact_key(&request.url, request.kind, request.format_id.as_deref(), None);
        pipeline.general_cache.put(key.clone(), DeliveryRef("old-ref".into()));

        let outcome = pipeline.deliver(&request).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Downloaded);
        assert_eq!(downloader.calls(), 1);
        assert_ne!(pipeline.general_cache.get(&key), Some(DeliveryRef("old-ref".into())));
    }

    #[tokio::test]
    async fn stable_cache_serves_other_url_forms() {
        let downloader = FakeDownloader::new(MB);
        let messenger = Arc::new(FakeMessenger::default());
        let pipeline = pipeline(downloader.clone(), messenger);
        pipeline.stable_cache.put("yt:abc:720p:video", DeliveryRef("shared".into()));

        let mut request = video_request();
        request.format_id = Some("h:720".into());
        let outcome = pipeline.deliver(&request).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Cached);
        assert_eq!(downloader.calls(), 0);
    }

    #[tokio::test]
    async fn stable_cache_is_checked_before_general() {
        let downloader = FakeDownloader::new(MB);
        let messenger = Arc::new(FakeMessenger::default());
        let pipeline = pipeline(downloader.clone(), messenger.clone());
        let request = video_request();
        let general_key = artifact_key(&request.url, request.kind, request.format_id.as_deref(), None);
        pipeline.general_cache.put(general_key, DeliveryRef("general-ref".into()));
        pipeline.stable_cache.put("yt:abc:720p:video", DeliveryRef("stable-ref".into()));

        let outcome = pipeline.deliver(&request).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Cached);
        assert_eq!(
            messenger.sent(),
            vec![(DeliveryKind::Video, MediaSource::Reference("stable-ref".into()))]
        );
        assert_eq!(downloader.calls(), 0);
    }

    #[tokio::test]
    async fn expired_token_sends_one_notice() {
        let downloader = FakeDownloader::new(MB);
        let messenger = Arc::new(FakeMessenger::default());
        let pipeline = pipeline(downloader.clone(), messenger.clone());

        let err = pipeline
            .run(&SelectionToken::from_raw("gone"), ReplyTarget::new(1, None), Lang::Ru)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ExpiredSelection));
        assert_eq!(*messenger.texts.lock(), vec![text(Lang::Ru, Text::ButtonExpired).to_string()]);
        assert_eq!(downloader.calls(), 0);
    }

    #[test]
    fn caption_uses_trimmed_title() {
        let pipeline = pipeline(FakeDownloader::new(0), Arc::new(FakeMessenger::default()));
        let mut request = video_request();
        request.title = Some("  ".into());
        assert_eq!(pipeline.caption(&request), text(Lang::Uz, Text::CaptionSuffix));
        request.title = Some("x".repeat(500));
        assert!(pipeline.caption(&request).starts_with(&"x".repeat(CAPTION_TITLE_CHARS)));
    }
}
