//! Canonical cache keys for media links.
//!
//! Nothing here is ever used to fetch media: the canonical form only decides
//! whether two links should share a delivered-artifact cache entry.

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use crate::tokens::DeliveryKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    YouTube,
    TikTok,
    Instagram,
    Facebook,
    OkRu,
}

impl Platform {
    pub fn detect(url: &str) -> Option<Self> {
        let u = url.to_lowercase();
        if u.contains("youtube.com") || u.contains("youtu.be") {
            Some(Self::YouTube)
        } else if u.contains("tiktok.com") {
            Some(Self::TikTok)
        } else if u.contains("instagram.com") || u.contains("instagr.am") {
            Some(Self::Instagram)
        } else if u.contains("facebook.com") || u.contains("fb.watch") || u.contains("fb.com") {
            Some(Self::Facebook)
        } else if u.contains("ok.ru") || u.contains("odnoklassniki.ru") {
            Some(Self::OkRu)
        } else {
            None
        }
    }

    /// Platforms whose formats are listed so the user can pick a resolution.
    pub fn offers_format_choice(self) -> bool {
        matches!(self, Self::YouTube)
    }
}

pub fn is_supported(url: &str) -> bool {
    Platform::detect(url).is_some()
}

lazy_static! {
    static ref URL_RE: Regex = Regex::new(r"(?i)https?://\S+").expect("valid url regex");
    static ref TIKTOK_PHOTO_RE: Regex = Regex::new(r"/photo/([0-9]+)/?$").expect("valid photo regex");
}

/// First `http(s)://` link in a message, without trailing punctuation.
pub fn extract_first_url(text: &str) -> Option<String> {
    let found = URL_RE.find(text)?;
    let url = found
        .as_str()
        .trim()
        .trim_end_matches(|c| matches!(c, ')' | '.' | ',' | '!' | '?' | ';' | '"' | '\''));
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

pub fn is_tiktok_photo(url: &str) -> bool {
    let u = url.to_lowercase();
    u.contains("tiktok.com") && u.contains("/photo/")
}

/// Short links that must be expanded before `/photo/` posts can be recognised.
pub fn is_tiktok_short_link(url: &str) -> bool {
    let u = url.to_lowercase();
    ["vt.tiktok.com", "vm.tiktok.com", "tiktok.com/t/"]
        .iter()
        .any(|marker| u.contains(marker))
}

/// `/photo/<id>` posts sometimes expose their soundtrack under `/video/<id>`.
pub fn tiktok_photo_to_video(url: &str) -> String {
    TIKTOK_PHOTO_RE.replace(url, "/video/$1").into_owned()
}

pub fn strip_query(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Maps a link onto its canonical cache-key form. Never fails: unparsable
/// input comes back trimmed.
pub fn normalize(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    canonical(trimmed).unwrap_or_else(|| trimmed.to_string())
}

fn canonical(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    let scheme = parsed.scheme().to_lowercase();
    let host = parsed.host_str()?.to_lowercase();
    let mut path = parsed.path().to_string();
    if path != "/" && path.ends_with('/') {
        path.pop();
    }
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let bare = |path: &str| format!("{scheme}://{host}{path}");

    if host.contains("youtu.be") {
        if let Some(id) = segments.first() {
            return Some(youtube_watch(id));
        }
    }
    if host.contains("youtube.com") {
        let id = query_value(&parsed, "v").or_else(|| match segments.as_slice() {
            [kind, id, ..] if matches!(*kind, "shorts" | "embed") => Some((*id).to_string()),
            _ => None,
        });
        if let Some(id) = id {
            return Some(youtube_watch(&id));
        }
    }

    if host.contains("tiktok.com") {
        return Some(bare(&path));
    }

    if host.contains("instagram.com") || host.contains("instagr.am") {
        if let [kind, id, ..] = segments.as_slice() {
            if matches!(*kind, "reel" | "p" | "tv") {
                return Some(bare(&format!("/{kind}/{id}")));
            }
        }
        return Some(bare(&path));
    }

    if host.contains("fb.watch") {
        return Some(match segments.first() {
            Some(code) => format!("https://fb.watch/{code}"),
            None => bare(&path),
        });
    }
    if host.contains("facebook.com") || host.contains("fb.com") {
        if path.starts_with("/watch") {
            return Some(match query_value(&parsed, "v") {
                Some(v) => format!("{scheme}://{host}/watch?v={v}"),
                None => bare("/watch"),
            });
        }
        if let ["reel", id, ..] = segments.as_slice() {
            return Some(bare(&format!("/reel/{id}")));
        }
        return Some(bare(&path));
    }

    // OK.ru and everything else: drop query and fragment.
    Some(bare(&path))
}

fn youtube_watch(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, v)| k == key && !v.is_empty())
        .map(|(_, v)| v.into_owned())
}

/// Cache key shared by every delivery of the same resource/kind/format.
pub fn artifact_key(
    url: &str,
    kind: DeliveryKind,
    format_id: Option<&str>,
    stable_key: Option<&str>,
) -> String {
    match stable_key {
        Some(stable) => format!("{stable}:{}", kind.as_str()),
        None => format!(
            "u:{}:{}:{}",
            normalize(url),
            kind.as_str(),
            format_id.unwrap_or_default()
        ),
    }
}

/// Platform-assigned identity of one resolution of a video, e.g. `yt:dQw4w9WgXcQ:720p`.
pub fn stable_key(video_id: &str, height: u32) -> Option<String> {
    if video_id.is_empty() {
        None
    } else {
        Some(format!("yt:{video_id}:{height}p"))
    }
}
