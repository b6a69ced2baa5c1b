//! Turns the raw yt-dlp format list into a short, deduplicated set of
//! resolution buttons with best-effort size estimates.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::{cmp::Reverse, collections::{HashMap, HashSet}};
use tracing::debug;

/// Resolution ladder offered to users, with the nearest-match tolerance of each rung.
pub const BUCKETS: [(u32, u32); 6] = [
    (144, 60),
    (240, 80),
    (360, 90),
    (480, 110),
    (720, 160),
    (1080, 220),
];

const MIN_REAL_HEIGHT: u32 = 100;
const FALLBACK_HEIGHTS: usize = 4;
const VIDEO_CONTAINERS: [&str; 3] = ["mp4", "webm", "mkv"];

lazy_static! {
    static ref P_TOKEN_RE: Regex =
        Regex::new(r"(?i)(?:^|[^0-9])([0-9]{3,4})p(?:[0-9]{1,3})?(?:[^0-9]|$)").expect("valid NNNp regex");
    static ref WXH_RE: Regex =
        Regex::new(r"(?i)(?:^|[^0-9])([0-9]{2,5})\s*[x×]\s*([0-9]{2,5})(?:[^0-9]|$)").expect("valid WxH regex");
    static ref STANDARD_HEIGHT_RE: Regex =
        Regex::new(r"(?:\b|_)(144|240|360|480|720|1080|1440|2160)(?:\b|_)").expect("valid height regex");
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    Unknown,
}

/// Item-level metadata returned by `yt-dlp -J`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
    #[serde(default)]
    pub formats: Vec<StreamDescriptor>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Thumbnail {
    pub url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// One encoding offered by the backend. Every field may be missing; use the
/// accessor methods rather than probing fields directly.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StreamDescriptor {
    #[serde(default)]
    pub format_id: String,
    pub ext: Option<String>,
    pub format: Option<String>,
    pub format_note: Option<String>,
    pub resolution: Option<String>,
    pub display_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub tbr: Option<f64>,
    pub vbr: Option<f64>,
    pub abr: Option<f64>,
    #[serde(default, deserialize_with = "lenient_size")]
    pub filesize: Option<u64>,
    #[serde(default, deserialize_with = "lenient_size")]
    pub filesize_approx: Option<u64>,
    pub protocol: Option<String>,
    pub manifest_url: Option<String>,
    pub fragments: Option<serde_json::Value>,
    pub url: Option<String>,
    pub duration: Option<f64>,
}

fn lenient_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64)),
        _ => None,
    }))
}

fn codec_present(codec: &Option<String>) -> bool {
    matches!(codec.as_deref(), Some(c) if !c.is_empty() && c != "none")
}

impl StreamDescriptor {
    pub fn has_video(&self) -> bool {
        codec_present(&self.vcodec)
    }

    pub fn has_audio(&self) -> bool {
        codec_present(&self.acodec)
    }

    pub fn is_audio_only(&self) -> bool {
        !self.has_video() && self.has_audio()
    }

    pub fn kind(&self) -> MediaKind {
        let ext = self.ext_lower();
        if !self.has_video() && !self.has_audio() && is_image_ext(&ext) {
            MediaKind::Image
        } else if self.has_video() {
            MediaKind::Video
        } else if self.has_audio() {
            MediaKind::Audio
        } else {
            MediaKind::Unknown
        }
    }

    fn ext_lower(&self) -> String {
        self.ext.as_deref().unwrap_or_default().to_lowercase()
    }

    /// Height in pixels, 0 when nothing usable is found.
    ///
    /// Order: numeric `height`; then each of `format_note`, `resolution`, `format`, `format_id`, `display_id` is
    /// scanned for an `NNNp` token, a `WxH` token, and a bare standard height.
    pub fn resolved_height(&self) -> u32 {
        if let Some(h) = self.height.filter(|h| *h > 0) {
            return h;
        }
        let fields = [
            self.format_note.as_deref(),
            self.resolution.as_deref(),
            self.format.as_deref(),
            Some(self.format_id.as_str()),
            self.display_id.as_deref(),
        ];
        fields
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .find_map(height_from_text)
            .unwrap_or(0)
    }

    pub fn is_storyboard(&self) -> bool {
        let id = self.format_id.to_lowercase();
        let format = self.format.as_deref().unwrap_or_default().to_lowercase();
        let note = self.format_note.as_deref().unwrap_or_default().to_lowercase();
        id.starts_with("sb") || format.contains("storyboard") || note.contains("storyboard")
    }

    /// A selectable video stream: has a video codec, a sane height, and a
    /// normal video container.
    pub fn is_real_video(&self) -> bool {
        if self.kind() != MediaKind::Video
            || self.resolved_height() < MIN_REAL_HEIGHT
            || self.is_storyboard()
        {
            return false;
        }
        let ext = self.ext_lower();
        ext.is_empty() || VIDEO_CONTAINERS.contains(&ext.as_str())
    }

    /// HLS and other manifest-backed streams only ever have estimated sizes.
    pub fn is_manifest_based(&self) -> bool {
        let proto = self.protocol.as_deref().unwrap_or_default().to_lowercase();
        proto.contains("m3u8") || self.manifest_url.is_some() || self.fragments.is_some()
    }

    fn bitrate_hint(&self) -> f64 {
        [self.tbr, self.vbr, self.abr]
            .into_iter()
            .flatten()
            .fold(0.0, f64::max)
    }

    fn rank_key(&self) -> (bool, u8, i64, i64) {
        let ext_score = match self.ext_lower().as_str() {
            "mp4" => 2,
            "webm" | "mkv" => 1,
            _ => 0,
        };
        let size = self.filesize.unwrap_or(0) + self.filesize_approx.unwrap_or(0);
        (
            self.url.is_some(),
            ext_score,
            (self.bitrate_hint() * 100.0) as i64,
            size as i64,
        )
    }

    fn audio_rank_key(&self) -> (i64, i64) {
        let ext_score = match self.ext_lower().as_str() {
            "m4a" => 2,
            "mp4" | "aac" => 1,
            _ => 0,
        };
        let bitrate = self.abr.unwrap_or(0.0).max(self.tbr.unwrap_or(0.0));
        let size = self.filesize.or(self.filesize_approx).unwrap_or(0);
        (((ext_score as f64) * 1000.0 + bitrate) as i64 * 100, size as i64)
    }

    /// Bytes of this stream alone, and whether that number is an estimate.
    fn own_size(&self, duration: Option<f64>, kbps: Option<f64>) -> SizeEstimate {
        if let Some(exact) = self.filesize.filter(|s| *s > 0) {
            return SizeEstimate { bytes: exact, approximate: self.is_manifest_based() };
        }
        if let Some(approx) = self.filesize_approx.filter(|s| *s > 0) {
            return SizeEstimate { bytes: approx, approximate: true };
        }
        let duration = self.duration.or(duration);
        let bytes = estimate_bytes_from_kbps(kbps, duration);
        SizeEstimate { bytes, approximate: bytes > 0 }
    }
}

fn height_from_text(text: &str) -> Option<u32> {
    if let Some(h) = P_TOKEN_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
    {
        return Some(h);
    }
    if let Some(caps) = WXH_RE.captures(text) {
        let w = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok());
        let h = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok());
        if let (Some(w), Some(h)) = (w, h) {
            if h >= MIN_REAL_HEIGHT && w >= h {
                return Some(h);
            }
        }
    }
    STANDARD_HEIGHT_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn is_image_ext(ext: &str) -> bool {
    matches!(
        ext,
        "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" | "avif" | "heic" | "heif"
    )
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SizeEstimate {
    pub bytes: u64,
    pub approximate: bool,
}

pub fn estimate_bytes_from_kbps(kbps: Option<f64>, duration_s: Option<f64>) -> u64 {
    match (kbps, duration_s) {
        (Some(kbps), Some(duration)) if kbps > 0.0 && duration > 0.0 => {
            (kbps * 1000.0 / 8.0 * duration) as u64
        }
        _ => 0,
    }
}

/// A user-facing resolution choice.
#[derive(Clone, Debug)]
pub struct FormatChoice {
    /// Ladder rung this choice represents.
    pub bucket: u32,
    /// Actual height of the chosen stream; this is what the button shows.
    pub height: u32,
    pub stream: StreamDescriptor,
    /// Video plus companion audio, 0 when unknown.
    pub total_size: u64,
    pub approximate: bool,
}

impl FormatChoice {
    pub fn label(&self) -> String {
        match human_mb_compact(self.total_size) {
            Some(size) if self.approximate => format!("{}p - ~{size}", self.height),
            Some(size) => format!("{}p - {size}", self.height),
            None => format!("{}p", self.height),
        }
    }
}

impl MediaInfo {
    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.formats.iter().filter(|f| f.is_audio_only())
    }

    /// The audio-only stream that would be paired with a video-only choice.
    pub fn best_audio(&self) -> Option<&StreamDescriptor> {
        self.audio_streams().max_by_key(|a| a.audio_rank_key())
    }

    pub fn best_audio_size(&self) -> SizeEstimate {
        match self.best_audio() {
            Some(audio) => {
                let kbps = audio.tbr.or(audio.abr);
                audio.own_size(self.duration, kbps)
            }
            None => SizeEstimate { bytes: 0, approximate: true },
        }
    }

    /// Delivery size of `stream`: its own size plus the best audio when it has
    /// none. Zero when the video part itself is unknown.
    pub fn total_size(&self, stream: &StreamDescriptor) -> SizeEstimate {
        let video = stream.own_size(self.duration, stream.tbr.or(stream.vbr));
        if video.bytes == 0 {
            return SizeEstimate::default();
        }
        let mut total = video;
        if !stream.has_audio() {
            let audio = self.best_audio_size();
            if audio.bytes > 0 {
                total.bytes += audio.bytes;
                total.approximate |= audio.approximate;
            }
        }
        total
    }

    /// Largest available preview image.
    pub fn best_thumbnail(&self) -> Option<&str> {
        if let Some(thumb) = self.thumbnail.as_deref().filter(|t| !t.is_empty()) {
            return Some(thumb);
        }
        self.thumbnails
            .iter()
            .filter(|t| t.url.is_some())
            .max_by_key(|t| (t.width.unwrap_or(0), t.height.unwrap_or(0)))
            .and_then(|t| t.url.as_deref())
    }

    /// Distinct heights of real video streams, highest first.
    pub fn real_heights(&self) -> Vec<u32> {
        let mut heights: Vec<u32> = self
            .formats
            .iter()
            .filter(|f| f.is_real_video())
            .map(StreamDescriptor::resolved_height)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        heights.sort_unstable_by(|a, b| b.cmp(a));
        heights
    }
}

/// Builds the resolution buttons for one item. Empty when the backend offered
/// no real video stream; callers then offer audio only.
pub fn select_formats(info: &MediaInfo) -> Vec<FormatChoice> {
    let mut by_height: HashMap<u32, &StreamDescriptor> = HashMap::new();
    for stream in info.formats.iter().filter(|f| f.is_real_video()) {
        let height = stream.resolved_height();
        match by_height.get(&height) {
            Some(best) if stream.rank_key() <= best.rank_key() => {}
            _ => {
                by_height.insert(height, stream);
            }
        }
    }
    if by_height.is_empty() {
        debug!(event = "select_formats_empty", total = info.formats.len());
        return Vec::new();
    }

    let mut heights: Vec<u32> = by_height.keys().copied().collect();
    heights.sort_unstable();

    let mut used_ids: HashSet<&str> = HashSet::new();
    let mut picked: Vec<(u32, u32)> = Vec::new();
    for (bucket, tolerance) in BUCKETS {
        let Some(height) = nearest_height(&heights, bucket, tolerance) else {
            continue;
        };
        let id = by_height[&height].format_id.as_str();
        if id.is_empty() || !used_ids.insert(id) {
            continue;
        }
        picked.push((bucket, height));
    }

    if picked.is_empty() {
        for &height in heights.iter().rev().take(FALLBACK_HEIGHTS) {
            let id = by_height[&height].format_id.as_str();
            if id.is_empty() || !used_ids.insert(id) {
                continue;
            }
            picked.push((height, height));
        }
    }

    let mut choices: Vec<FormatChoice> = picked
        .into_iter()
        .map(|(bucket, height)| {
            let stream = by_height[&height];
            let size = info.total_size(stream);
            FormatChoice {
                bucket,
                height,
                stream: stream.clone(),
                total_size: size.bytes,
                approximate: size.approximate,
            }
        })
        .collect();
    choices.sort_by(|a, b| b.bucket.cmp(&a.bucket));

    debug!(
        event = "select_formats_done",
        total = info.formats.len(),
        real_heights = ?heights,
        choices = choices.len()
    );
    choices
}

/// Closest height within `tolerance` of `target`; ties go to the higher one.
fn nearest_height(heights: &[u32], target: u32, tolerance: u32) -> Option<u32> {
    heights
        .iter()
        .copied()
        .filter(|h| h.abs_diff(target) <= tolerance)
        .min_by_key(|h| (h.abs_diff(target), Reverse(*h)))
}

/// `12MB` above ten megabytes, `3.4MB` below; `None` for an unknown size.
pub fn human_mb_compact(bytes: u64) -> Option<String> {
    if bytes == 0 {
        return None;
    }
    let mb = bytes as f64 / (1024.0 * 1024.0);
    if mb >= 10.0 {
        Some(format!("{mb:.0}MB"))
    } else {
        Some(format!("{mb:.1}MB"))
    }
}

pub fn human_duration(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds.filter(|s| *s > 0.0) else {
        return "-".to_string();
    };
    let s = seconds as u64;
    let (h, m, ss) = (s / 3600, (s % 3600) / 60, s % 60);
    if h > 0 {
        format!("{h}:{m:02}:{ss:02}")
    } else {
        format!("{m}:{ss:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn video(id: &str, height: u32, size: Option<u64>) -> StreamDescriptor {
        StreamDescriptor {
            format_id: id.into(),
            ext: Some("mp4".into()),
            height: Some(height),
            width: Some(height * 16 / 9),
            vcodec: Some("avc1.4d401f".into()),
            acodec: Some("none".into()),
            filesize: size,
            url: Some(format!("https://cdn.example/{id}")),
            ..StreamDescriptor::default()
        }
    }

    fn audio(id: &str, ext: &str, abr: f64, size: Option<u64>) -> StreamDescriptor {
        StreamDescriptor {
            format_id: id.into(),
            ext: Some(ext.into()),
            vcodec: Some("none".into()),
            acodec: Some("mp4a.40.2".into()),
            abr: Some(abr),
            filesize: size,
            ..StreamDescriptor::default()
        }
    }

    fn info(formats: Vec<StreamDescriptor>) -> MediaInfo {
        MediaInfo {
            id: Some("abc".into()),
            duration: Some(100.0),
            formats,
            ..MediaInfo::default()
        }
    }

    #[test]
    fn three_heights_map_to_three_buckets() {
        let info = info(vec![
            video("160", 144, Some(1_000_000)),
            video("134", 360, Some(3_000_000)),
            video("136", 720, Some(9_000_000)),
        ]);
        let choices = select_formats(&info);
        let summary: Vec<(u32, u32, &str)> = choices
            .iter()
            .map(|c| (c.bucket, c.height, c.stream.format_id.as_str()))
            .collect();
        assert_eq!(summary, vec![(720, 720, "136"), (360, 360, "134"), (144, 144, "160")]);
    }

    #[test]
    fn buckets_are_unique_and_streams_are_real() {
        let mut formats = vec![
            video("a", 270, Some(2_000_000)),
            video("b", 1080, Some(20_000_000)),
            video("c", 1440, Some(40_000_000)),
        ];
        formats.push(StreamDescriptor {
            format_id: "sb0".into(),
            ext: Some("mhtml".into()),
            vcodec: Some("images".into()),
            height: Some(180),
            format_note: Some("storyboard".into()),
            ..StreamDescriptor::default()
        });
        let choices = select_formats(&info(formats));
        let buckets: HashSet<u32> = choices.iter().map(|c| c.bucket).collect();
        assert_eq!(buckets.len(), choices.len());
        assert!(choices.iter().all(|c| c.stream.is_real_video()));
        // 270 sits within both the 240 and 360 windows but is offered once.
        assert_eq!(choices.iter().filter(|c| c.stream.format_id == "a").count(), 1);
    }

    #[test]
    fn ties_prefer_the_higher_height() {
        assert_eq!(nearest_height(&[300, 420], 360, 90), Some(420));
        assert_eq!(nearest_height(&[100], 360, 90), None);
    }

    #[test]
    fn falls_back_to_top_heights_outside_the_ladder() {
        let info = info(vec![
            video("x1", 2160, None),
            video("x2", 1800, None),
            video("x3", 1700, None),
            video("x4", 1600, None),
            video("x5", 1500, None),
        ]);
        let heights: Vec<u32> = select_formats(&info).iter().map(|c| c.height).collect();
        assert_eq!(heights, vec![2160, 1800, 1700, 1600]);
    }

    #[test]
    fn no_real_video_yields_empty_list() {
        let info = info(vec![audio("140", "m4a", 128.0, Some(1_000_000))]);
        assert!(select_formats(&info).is_empty());
    }

    #[test]
    fn height_falls_back_through_text_fields() {
        let from_note = StreamDescriptor {
            format_note: Some("1080p60".into()),
            ..StreamDescriptor::default()
        };
        assert_eq!(from_note.resolved_height(), 1080);

        let from_resolution = StreamDescriptor {
            resolution: Some("640×360".into()),
            ..StreamDescriptor::default()
        };
        assert_eq!(from_resolution.resolved_height(), 360);

        let portrait = StreamDescriptor {
            resolution: Some("360x640".into()),
            ..StreamDescriptor::default()
        };
        assert_eq!(portrait.resolved_height(), 0);

        let bare = StreamDescriptor {
            format_id: "hls_480_x".into(),
            ..StreamDescriptor::default()
        };
        assert_eq!(bare.resolved_height(), 480);

        let itag_only = StreamDescriptor {
            format_id: "137".into(),
            ..StreamDescriptor::default()
        };
        assert_eq!(itag_only.resolved_height(), 0);

        let width_only = StreamDescriptor {
            width: Some(1280),
            height: Some(0),
            format_note: Some("720p".into()),
            ..StreamDescriptor::default()
        };
        assert_eq!(width_only.resolved_height(), 720);
    }

    #[test]
    fn ranking_prefers_url_then_mp4_then_bitrate() {
        let mut webm = video("248", 1080, Some(50_000_000));
        webm.ext = Some("webm".into());
        let mp4 = video("137", 1080, Some(10_000_000));
        let choices = select_formats(&info(vec![webm, mp4]));
        assert_eq!(choices[0].stream.format_id, "137");
    }

    #[test]
    fn video_only_size_adds_best_audio() {
        let info = info(vec![
            video("136", 720, Some(10_000_000)),
            audio("251", "webm", 160.0, Some(3_000_000)),
            audio("140", "m4a", 128.0, Some(2_000_000)),
        ]);
        let choices = select_formats(&info);
        assert_eq!(choices[0].total_size, 12_000_000);
        assert!(!choices[0].approximate);
    }

    #[test]
    fn estimated_and_manifest_sizes_are_approximate() {
        let mut hls = video("hls-720", 720, Some(10_000_000));
        hls.protocol = Some("m3u8_native".into());
        hls.acodec = Some("mp4a".into());
        assert!(info(vec![hls.clone()]).total_size(&hls).approximate);

        let mut estimated = video("136", 720, None);
        estimated.tbr = Some(800.0);
        let size = info(vec![estimated.clone()]).total_size(&estimated);
        assert_eq!(size.bytes, 10_000_000);
        assert!(size.approximate);

        let unknown = video("135", 480, None);
        let size = info(vec![unknown.clone()]).total_size(&unknown);
        assert_eq!(size, SizeEstimate::default());
    }

    #[test]
    fn labels_never_show_zero_sizes() {
        let choice = FormatChoice {
            bucket: 720,
            height: 720,
            stream: video("136", 720, None),
            total_size: 0,
            approximate: true,
        };
        assert_eq!(choice.label(), "720p");
        let sized = FormatChoice { total_size: 12 * 1024 * 1024, ..choice.clone() };
        assert_eq!(sized.label(), "720p - ~12MB");
        let small = FormatChoice { total_size: 3 * 1024 * 1024 / 2, approximate: false, ..choice };
        assert_eq!(small.label(), "720p - 1.5MB");
    }

    #[test]
    fn parses_yt_dlp_json() {
        let raw = r#"{
            "id": "abc", "title": "Clip", "duration": 61.5,
            "thumbnails": [{"url": "s.jpg", "width": 120}, {"url": "l.jpg", "width": 1280}],
            "formats": [
                {"format_id": "18", "ext": "mp4", "height": 360, "vcodec": "avc1", "acodec": "mp4a",
                 "filesize_approx": 1234567.0, "tbr": 500.5, "url": "https://x"}
            ]
        }"#;
        let info: MediaInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.best_thumbnail(), Some("l.jpg"));
        assert_eq!(info.formats[0].filesize_approx, Some(1_234_567));
        assert_eq!(info.formats[0].kind(), MediaKind::Video);
        assert_eq!(info.real_heights(), vec![360]);
    }

    #[test]
    fn durations_render_like_a_player() {
        assert_eq!(human_duration(Some(61.0)), "1:01");
        assert_eq!(human_duration(Some(3725.0)), "1:02:05");
        assert_eq!(human_duration(None), "-");
    }
}
