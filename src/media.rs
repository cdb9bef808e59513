//! Upload and output file layout.
//!
//! Uploaded clips land in the upload directory, annotated results in the
//! processed directory as `<uuid>_<sanitized stem>.mp4` whatever container
//! the upload came in. Every file
//! created for a request is registered with a `TempFiles` guard so it is
//! removed whatever the outcome.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use uuid::Uuid;

use crate::error::VigilError;

/// Accepted upload extensions, lowercase.
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["mp4", "mov", "avi", "mkv"];

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

const MAX_NAME_LEN: usize = 128;

/// Reduce an untrusted client file name to `[A-Za-z0-9._-]`, without any
/// directory part or leading dots. May return an empty string.
pub fn sanitize_filename(name: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let unsafe_chars = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("static regex"));
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let spaced = base.trim().replace(char::is_whitespace, "_");
    let cleaned = unsafe_chars.replace_all(&spaced, "");
    cleaned
        .trim_start_matches(['.', '_'])
        .chars()
        .take(MAX_NAME_LEN)
        .collect()
}

/// Lowercased extension of `name` when it is one of `ALLOWED_EXTENSIONS`.
pub fn allowed_extension(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

#[derive(Clone, Debug, PartialEq)]
pub struct MediaLayout {
    upload_dir: PathBuf,
    processed_dir: PathBuf,
}

impl MediaLayout {
    pub fn new(upload_dir: impl Into<PathBuf>, processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            processed_dir: processed_dir.into(),
        }
    }

    /// Create both directories if missing.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.upload_dir, &self.processed_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed_dir
    }

    /// Validate a client file name and allocate every path one request needs.
    pub fn plan(&self, original_name: &str) -> Result<UploadPlan, VigilError> {
        let name = sanitize_filename(original_name);
        if name.is_empty() || allowed_extension(&name).is_none() {
            return Err(VigilError::InvalidInput(format!(
                "unsupported file '{}'; allowed: {}",
                original_name,
                ALLOWED_EXTENSIONS.join(", ")
            )));
        }
        let id = Uuid::new_v4();
        let stem = Path::new(&name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output_name = format!("{}_{}.mp4", id, stem);
        Ok(UploadPlan {
            input_path: self.upload_dir.join(format!("{}_{}", id, name)),
            output_path: self.processed_dir.join(&output_name),
            display_name: name,
            output_name,
        })
    }

    /// Resolve a processed file requested by a client.
    ///
    /// `InvalidInput` for names that do not survive sanitizing or have a
    /// disallowed extension; `Ok(None)` when the file does not exist.
    pub fn processed_file(&self, requested: &str) -> Result<Option<PathBuf>, VigilError> {
        let name = sanitize_filename(requested);
        if name.is_empty() || name != requested {
            return Err(VigilError::InvalidInput(format!("invalid file name '{}'", requested)));
        }
        if allowed_extension(&name).is_none() {
            return Err(VigilError::InvalidInput(format!("invalid file type '{}'", requested)));
        }
        let path = self.processed_dir.join(name);
        Ok(path.is_file().then_some(path))
    }
}

/// Paths for one upload request.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadPlan {
    /// Where the upload is stored while processing.
    pub input_path: PathBuf,
    /// Final MP4 in the processed directory.
    pub output_path: PathBuf,
    /// File name served under `/processed/`.
    pub output_name: String,
    /// Sanitized client file name, used in alerts.
    pub display_name: String,
}

/// Removes its registered files on drop. Missing files are ignored.
#[derive(Debug, Default)]
pub struct TempFiles {
    paths: Vec<PathBuf>,
}

impl TempFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    /// Stop tracking `path` so it survives the guard.
    pub fn keep(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("removed temporary file {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("failed to remove {}: {}", path.display(), err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories_and_unsafe_chars() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\clips\\my clip (1).mp4"), "my_clip_1.mp4");
        assert_eq!(sanitize_filename("..hidden.mov"), "hidden.mov");
        assert_eq!(sanitize_filename("///"), "");
    }

    #[test]
    fn extensions_are_case_insensitive() {
        assert_eq!(allowed_extension("a.MP4").as_deref(), Some("mp4"));
        assert!(allowed_extension("a.mkv").is_some());
        assert!(allowed_extension("a.gif").is_none());
        assert!(allowed_extension("mp4").is_none());
    }

    #[test]
    fn plan_names_output_with_uuid_prefix() {
        let layout = MediaLayout::new("/u", "/p");
        let plan = layout.plan("street fight.mp4").unwrap();
        assert!(plan.output_name.ends_with("_street_fight.mp4"));
        assert_eq!(plan.output_name.len(), 36 + 1 + "street_fight.mp4".len());
        assert!(plan.output_path.starts_with("/p"));
        assert!(plan.input_path.starts_with("/u"));
        assert_ne!(plan.input_path, plan.output_path);
        assert_eq!(plan.display_name, "street_fight.mp4");
    }

    #[test]
    fn output_is_always_an_mp4() {
        let layout = MediaLayout::new("/u", "/p");
        let plan = layout.plan("clip.AVI").unwrap();
        assert!(plan.output_name.ends_with("_clip.mp4"));
        assert!(plan.input_path.to_string_lossy().ends_with("_clip.AVI"));
        assert_eq!(plan.display_name, "clip.AVI");
        let plan = layout.plan("night.shift.mkv").unwrap();
        assert!(plan.output_name.ends_with("_night.shift.mp4"));
    }

    #[test]
    fn plan_rejects_disallowed_types() {
        let layout = MediaLayout::new("/u", "/p");
        assert!(matches!(layout.plan("notes.txt"), Err(VigilError::InvalidInput(_))));
        assert!(matches!(layout.plan(""), Err(VigilError::InvalidInput(_))));
    }

    #[test]
    fn processed_lookup_distinguishes_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let layout = MediaLayout::new(dir.path().join("u"), dir.path());
        std::fs::write(dir.path().join("abc_clip.mp4"), b"x").unwrap();
        assert!(layout.processed_file("abc_clip.mp4").unwrap().is_some());
        assert!(layout.processed_file("nope.mp4").unwrap().is_none());
        assert!(layout.processed_file("abc_clip.txt").is_err());
        assert!(layout.processed_file("../abc_clip.mp4").is_err());
    }

    #[test]
    fn temp_files_are_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let doomed = dir.path().join("a.rgb");
        let kept = dir.path().join("b.mp4");
        std::fs::write(&doomed, b"1").unwrap();
        std::fs::write(&kept, b"2").unwrap();
        {
            let mut temp = TempFiles::new();
            temp.track(&doomed);
            temp.track(&kept);
            temp.track(dir.path().join("never-created"));
            temp.keep(&kept);
        }
        assert!(!doomed.exists());
        assert!(kept.exists());
    }
}
