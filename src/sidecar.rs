//! ffmpeg-backed implementations of the frame-extractor and video-converter
//! capabilities, for the CLI and for hosts without an injected converter.
//! Conversion shells out and blocks; register these only where that is
//! acceptable (headless tooling, not a live UI thread).

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

use crate::capabilities::{FrameExtractor, VideoConverter};
use crate::frame::{decode_image_bytes, StillFrame};
use crate::page::FileSelection;
use crate::LocalBoxFuture;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

fn ffmpeg_binary() -> Result<PathBuf> {
    let path = ffmpeg_sidecar::paths::ffmpeg_path();
    if !path.exists() {
        ffmpeg_sidecar::download::auto_download()
            .context("failed to auto-download ffmpeg sidecar binary")?;
    }
    Ok(path)
}

fn scratch_path(label: &str, extension: &str) -> PathBuf {
    let serial = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "ava-{}-{serial}-{label}{extension}",
        std::process::id()
    ))
}

fn name_extension(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => format!(".{ext}"),
        _ => ".bin".to_owned(),
    }
}

fn run_ffmpeg(args: &[String]) -> Result<()> {
    let binary = ffmpeg_binary()?;
    let output = Command::new(&binary)
        .args(["-hide_banner", "-loglevel", "error", "-y"])
        .args(args.iter().map(String::as_str))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to spawn ffmpeg at {}", binary.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffmpeg failed with status {} (args='{}', stderr='{}')",
            output.status,
            args.join(" "),
            stderr.trim()
        );
    }
    Ok(())
}

fn extract_still_blocking(file: &FileSelection) -> Result<StillFrame> {
    let input = scratch_path("still-in", &name_extension(&file.name));
    let output = scratch_path("still-out", ".png");
    fs::write(&input, &file.bytes)
        .with_context(|| format!("failed to write scratch input {}", input.display()))?;

    // Seek a little way in for a non-black frame; clips shorter than the
    // seek point produce no output, so retry from the start.
    let seeked = run_ffmpeg(&[
        "-ss".to_owned(),
        "0.5".to_owned(),
        "-i".to_owned(),
        input.to_string_lossy().into_owned(),
        "-frames:v".to_owned(),
        "1".to_owned(),
        output.to_string_lossy().into_owned(),
    ]);
    if seeked.is_err() || !output.exists() {
        run_ffmpeg(&[
            "-i".to_owned(),
            input.to_string_lossy().into_owned(),
            "-frames:v".to_owned(),
            "1".to_owned(),
            output.to_string_lossy().into_owned(),
        ])?;
    }

    let png = fs::read(&output)
        .with_context(|| format!("ffmpeg produced no still frame at {}", output.display()));
    let _ = fs::remove_file(&input);
    let _ = fs::remove_file(&output);
    decode_image_bytes(&png?)
}

fn convert_blocking(file: &FileSelection) -> Result<Vec<u8>> {
    let input = scratch_path("convert-in", &name_extension(&file.name));
    let output = scratch_path("convert-out", ".webp");
    fs::write(&input, &file.bytes)
        .with_context(|| format!("failed to write scratch input {}", input.display()))?;

    let converted = run_ffmpeg(&[
        "-i".to_owned(),
        input.to_string_lossy().into_owned(),
        "-c:v".to_owned(),
        "libwebp".to_owned(),
        "-loop".to_owned(),
        "0".to_owned(),
        "-q:v".to_owned(),
        "75".to_owned(),
        "-an".to_owned(),
        output.to_string_lossy().into_owned(),
    ]);

    let bytes = converted.and_then(|_| {
        fs::read(&output)
            .with_context(|| format!("ffmpeg produced no webp at {}", output.display()))
    });
    let _ = fs::remove_file(&input);
    let _ = fs::remove_file(&output);
    bytes
}

/// Still-frame extraction via the ffmpeg sidecar binary.
pub struct SidecarFrameExtractor;

impl FrameExtractor for SidecarFrameExtractor {
    fn extract_still<'a>(
        &'a self,
        file: &'a FileSelection,
    ) -> LocalBoxFuture<'a, Result<StillFrame>> {
        Box::pin(async move { extract_still_blocking(file) })
    }
}

/// Video to animated webp via the ffmpeg sidecar binary.
pub struct SidecarVideoConverter;

impl VideoConverter for SidecarVideoConverter {
    fn convert<'a>(&'a self, file: &'a FileSelection) -> LocalBoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { convert_blocking(file) })
    }
}

#[cfg(test)]
mod tests {
    use super::name_extension;

    #[test]
    fn scratch_extension_falls_back_for_odd_names() {
        assert_eq!(name_extension("clip.mov"), ".mov");
        assert_eq!(name_extension("archive.tar.gz"), ".gz");
        assert_eq!(name_extension("noext"), ".bin");
        assert_eq!(name_extension(".hidden"), ".bin");
    }
}
