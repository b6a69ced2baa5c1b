use crate::{i18n::Lang, messenger::ReplyTarget};
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
};
use tracing::debug;

const TOKEN_LEN: usize = 10;

/// Short random handle that fits into button callback data.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SelectionToken(String);

impl SelectionToken {
    pub fn new() -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl Default for SelectionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SelectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DeliveryKind {
    Video,
    Audio,
    /// Every image of a TikTok photo post, zipped.
    PhotoBundle,
    /// Soundtrack of a TikTok photo post.
    PhotoAudio,
}

impl DeliveryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::PhotoBundle => "photo_bundle",
            Self::PhotoAudio => "photo_audio",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::Audio | Self::PhotoAudio)
    }
}

/// Everything needed to deliver one button press.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedRequest {
    pub url: String,
    pub kind: DeliveryKind,
    /// Explicit stream id, or `h:<height>` for a height cap.
    pub format_id: Option<String>,
    pub has_audio: Option<bool>,
    /// Pre-computed delivery size of the chosen format, when known.
    pub total_bytes: Option<u64>,
    pub stable_key: Option<String>,
    pub title: Option<String>,
    pub reply_to: ReplyTarget,
    pub lang: Lang,
}

impl ResolvedRequest {
    pub fn new(url: impl Into<String>, kind: DeliveryKind, reply_to: ReplyTarget, lang: Lang) -> Self {
        Self {
            url: url.into(),
            kind,
            format_id: None,
            has_audio: None,
            total_bytes: None,
            stable_key: None,
            title: None,
            reply_to,
            lang,
        }
    }
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<SelectionToken, ResolvedRequest>,
    order: VecDeque<SelectionToken>,
}

/// Bounded FIFO map from button tokens to resolved requests.
///
/// When full, the oldest half is dropped before the next insert. Reads never
/// reorder or remove entries, so one button can be pressed many times.
pub struct SelectionTokenStore {
    inner: Mutex<StoreInner>,
    capacity: usize,
}

impl SelectionTokenStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            capacity: capacity.max(2),
        }
    }

    pub fn put(&self, request: ResolvedRequest) -> SelectionToken {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.capacity {
            let evict = inner.entries.len() / 2;
            for _ in 0..evict {
                if let Some(old) = inner.order.pop_front() {
                    inner.entries.remove(&old);
                }
            }
            debug!(event = "selection_tokens_evicted", evicted = evict, remaining = inner.entries.len());
        }

        let mut token = SelectionToken::new();
        while inner.entries.contains_key(&token) {
            token = SelectionToken::new();
        }
        inner.order.push_back(token.clone());
        inner.entries.insert(token.clone(), request);
        token
    }

    pub fn get(&self, token: &SelectionToken) -> Option<ResolvedRequest> {
        self.inner.lock().entries.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CallbackAction {
    Download(SelectionToken),
    Language(Lang),
}

const DOWNLOAD_CALLBACK_PREFIX: &str = "dl:";
const LANGUAGE_CALLBACK_PREFIX: &str = "lang:";

pub fn build_download_callback(token: &SelectionToken) -> String {
    format!("{DOWNLOAD_CALLBACK_PREFIX}{}", token.as_str())
}

pub fn build_language_callback(lang: Lang) -> String {
    format!("{LANGUAGE_CALLBACK_PREFIX}{}", lang.code())
}

pub fn parse_callback(data: &str) -> Option<CallbackAction> {
    if let Some(payload) = data.strip_prefix(DOWNLOAD_CALLBACK_PREFIX) {
        let token = payload.trim();
        if token.is_empty() {
            return None;
        }
        return Some(CallbackAction::Download(SelectionToken::from_raw(token)));
    }
    let code = data.strip_prefix(LANGUAGE_CALLBACK_PREFIX)?;
    Lang::from_code(code).map(CallbackAction::Language)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> ResolvedRequest {
        ResolvedRequest::new(url, DeliveryKind::Video, ReplyTarget::new(1, Some(10)), Lang::Uz)
    }

    #[test]
    fn tokens_are_ten_alphanumerics() {
        let token = SelectionToken::new();
        assert_eq!(token.as_str().len(), TOKEN_LEN);
        assert!(token.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn callback_roundtrip() {
        let token = SelectionToken::from_raw("abc123XYZ0");
        let data = build_download_callback(&token);
        assert_eq!(data, "dl:abc123XYZ0");
        assert_eq!(parse_callback(&data), Some(CallbackAction::Download(token)));
        assert_eq!(
            parse_callback(&build_language_callback(Lang::Ru)),
            Some(CallbackAction::Language(Lang::Ru))
        );
        assert_eq!(parse_callback("dl:"), None);
        assert_eq!(parse_callback("lang:xx"), None);
        assert_eq!(parse_callback("task:1:2"), None);
    }

    #[test]
    fn get_does_not_consume() {
        let store = SelectionTokenStore::new(10);
        let token = store.put(request("https://youtu.be/a"));
        assert_eq!(store.get(&token).map(|r| r.url), Some("https://youtu.be/a".to_string()));
        assert!(store.get(&token).is_some());
        assert_eq!(store.len(), 1);
        assert!(store.get(&SelectionToken::from_raw("missing")).is_none());
    }

    #[test]
    fn full_store_evicts_oldest_half() {
        let store = SelectionTokenStore::new(4);
        let tokens: Vec<SelectionToken> = (0..4)
            .map(|i| store.put(request(&format!("https://x/{i}"))))
            .collect();
        assert_eq!(store.len(), 4);

        let newest = store.put(request("https://x/new"));
        assert_eq!(store.len(), 3);
        assert!(store.get(&tokens[0]).is_none());
        assert!(store.get(&tokens[1]).is_none());
        assert!(store.get(&tokens[2]).is_some());
        assert!(store.get(&tokens[3]).is_some());
        assert!(store.get(&newest).is_some());
    }

    #[test]
    fn never_exceeds_capacity() {
        let store = SelectionTokenStore::new(6);
        for i in 0..50 {
            store.put(request(&format!("https://x/{i}")));
            assert!(store.len() <= 6);
        }
    }
}
