//! `gallery-dl` and `ffmpeg` subprocesses used for TikTok photo posts.

use crate::error::{truncate_diagnostic, ToolError};
use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};
use tokio::process::Command;
use tracing::{info, instrument, warn};

pub const TOOL_TIMEOUT: Duration = Duration::from_secs(180);

const GALLERY_DL: &str = "gallery-dl";
const FFMPEG: &str = "ffmpeg";
const ZIP: &str = "zip";

const IMAGE_EXTS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];
const MEDIA_EXTS: [&str; 9] = ["mp4", "m4a", "mp3", "aac", "webm", "ogg", "opus", "wav", "mov"];

async fn run_tool(tool: &'static str, mut cmd: Command) -> Result<Output, ToolError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ToolError::Missing(tool),
        _ => ToolError::Failed {
            tool,
            stderr: e.to_string(),
        },
    })?;

    let output = tokio::time::timeout(TOOL_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| ToolError::Timeout(tool))?
        .map_err(|e| ToolError::Failed {
            tool,
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(event = "tool_failed", tool, status = %output.status, stderr = %stderr.trim());
        return Err(ToolError::Failed {
            tool,
            stderr: truncate_diagnostic(stderr.trim()),
        });
    }
    Ok(output)
}

async fn gallery_dl(url: &str, dest: &Path) -> Result<(), ToolError> {
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| ToolError::NoOutput(e.to_string()))?;
    let mut cmd = Command::new(GALLERY_DL);
    cmd.arg("-d").arg(dest).arg(url);
    run_tool(GALLERY_DL, cmd).await?;
    Ok(())
}

/// Downloads every image of a photo post and packs them into one zip archive.
#[instrument(skip(workdir))]
pub async fn bundle_photos(url: &str, workdir: &Path) -> Result<PathBuf, ToolError> {
    let dest = workdir.join("photos");
    gallery_dl(url, &dest).await?;

    let mut images: Vec<PathBuf> = collect_files(&dest)
        .await
        .into_iter()
        .filter(|p| has_ext(p, &IMAGE_EXTS))
        .collect();
    if images.is_empty() {
        return Err(ToolError::NoOutput("no images in photo post".into()));
    }
    images.sort();

    let archive = workdir.join("tiktok_photos.zip");
    let target = archive.clone();
    let count = images.len();
    tokio::task::spawn_blocking(move || write_zip(&target, &images))
        .await
        .map_err(|e| ToolError::Failed {
            tool: ZIP,
            stderr: e.to_string(),
        })??;
    info!(event = "photo_bundle_ready", images = count, path = %archive.display());
    Ok(archive)
}

fn write_zip(archive: &Path, files: &[PathBuf]) -> Result<(), ToolError> {
    use zip::{write::FileOptions, CompressionMethod, ZipWriter};

    let file = std::fs::File::create(archive).map_err(zip_err)?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for (index, path) in files.iter().enumerate() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("image_{index}.jpg"));
        let data = std::fs::read(path).map_err(zip_err)?;
        zip.start_file(format!("{:02}_{name}", index + 1), options)
            .map_err(zip_err)?;
        zip.write_all(&data).map_err(zip_err)?;
    }
    zip.finish().map_err(zip_err)?;
    Ok(())
}

fn zip_err(e: impl std::fmt::Display) -> ToolError {
    ToolError::Failed {
        tool: ZIP,
        stderr: e.to_string(),
    }
}

/// Converts `input` to MP3 at 192k, falling back to a stream copy into m4a.
#[instrument(skip(workdir))]
pub async fn extract_audio(input: &Path, workdir: &Path) -> Result<PathBuf, ToolError> {
    let mp3 = workdir.join("audio.mp3");
    let mut cmd = Command::new(FFMPEG);
    cmd.arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-vn", "-acodec", "libmp3lame", "-b:a", "192k"])
        .arg(&mp3);
    match run_tool(FFMPEG, cmd).await {
        Ok(_) => return Ok(mp3),
        Err(ToolError::Failed { .. }) => {
            warn!(event = "ffmpeg_mp3_failed", "retrying with stream copy");
        }
        Err(other) => return Err(other),
    }

    let m4a = workdir.join("audio.m4a");
    let mut cmd = Command::new(FFMPEG);
    cmd.arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-vn", "-acodec", "copy"])
        .arg(&m4a);
    run_tool(FFMPEG, cmd).await?;
    Ok(m4a)
}

/// Last resort for photo-post audio: fetch the post with gallery-dl and pull
/// the soundtrack out of its largest media file. Without ffmpeg the media
/// file itself is returned.
#[instrument(skip(workdir))]
pub async fn photo_audio_from_gallery(url: &str, workdir: &Path) -> Result<PathBuf, ToolError> {
    let dest = workdir.join("media");
    gallery_dl(url, &dest).await?;

    let largest = largest_file(
        collect_files(&dest)
            .await
            .into_iter()
            .filter(|p| has_ext(p, &MEDIA_EXTS)),
    )
    .ok_or_else(|| ToolError::NoOutput("no audio in photo post".into()))?;

    match extract_audio(&largest, workdir).await {
        Ok(path) => Ok(path),
        Err(ToolError::Missing(tool)) => {
            warn!(event = "ffmpeg_missing", tool, "delivering media as-is");
            Ok(largest)
        }
        Err(err) => Err(err),
    }
}

fn has_ext(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub(crate) fn largest_file(paths: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    paths
        .into_iter()
        .filter_map(|p| std::fs::metadata(&p).ok().map(|m| (m.len(), p)))
        .max_by_key(|(len, _)| *len)
        .map(|(_, p)| p)
}

/// Regular files under `root`, recursively. Unreadable directories are skipped.
pub(crate) async fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => pending.push(entry.path()),
                Ok(ft) if ft.is_file() => files.push(entry.path()),
                _ => {}
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_nested_files_and_picks_largest() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("small.mp4"), vec![0u8; 10]).unwrap();
        std::fs::write(nested.join("big.m4a"), vec![0u8; 100]).unwrap();
        std::fs::write(nested.join("cover.jpg"), vec![0u8; 1000]).unwrap();

        let files = collect_files(dir.path()).await;
        assert_eq!(files.len(), 3);
        let media = files.into_iter().filter(|p| has_ext(p, &MEDIA_EXTS));
        assert_eq!(largest_file(media), Some(nested.join("big.m4a")));
    }

    #[test]
    fn zips_images_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.PNG");
        std::fs::write(&a, b"first").unwrap();
        std::fs::write(&b, b"second").unwrap();
        assert!(has_ext(&b, &IMAGE_EXTS));

        let archive = dir.path().join("out.zip");
        write_zip(&archive, &[a, b]).unwrap();

        let file = std::fs::File::open(&archive).unwrap();
        let mut zip = zip::ZipArchive::new(file).unwrap();
        assert_eq!(zip.len(), 2);
        assert_eq!(zip.by_index(0).unwrap().name(), "01_a.jpg");
        assert_eq!(zip.by_index(1).unwrap().name(), "02_b.PNG");
    }

    #[tokio::test]
    async fn missing_binary_maps_to_missing() {
        let cmd = Command::new("definitely-not-a-real-tool-binary");
        let err = run_tool("fake", cmd).await.unwrap_err();
        assert_eq!(err, ToolError::Missing("fake"));
    }
}
