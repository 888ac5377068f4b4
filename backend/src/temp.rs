use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A request-scoped file on disk. The file is removed when the guard drops,
/// whichever way the owning scope exits.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    /// Writes `bytes` to a fresh, collision-free path under `dir`.
    pub fn write(dir: &Path, original_name: &str, bytes: &[u8]) -> io::Result<Self> {
        let guard = Self::reserve(dir, original_name);
        fs::write(&guard.path, bytes)?;
        log::debug!("Temporary file written: {}", guard.path.display());
        Ok(guard)
    }

    /// Allocates a unique path without creating the file. Whatever ends up at
    /// that path is removed on drop.
    pub fn reserve(dir: &Path, name: &str) -> Self {
        let unique = format!("{}_{}", Uuid::new_v4(), sanitize_filename(name));
        Self {
            path: dir.join(unique),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => log::info!("Temporary file removed: {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::error!(
                "Failed to remove temporary file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Reduces a client-supplied filename to a safe single path component.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() => Some(c),
            '.' | '-' | '_' => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches(['.', '_']).to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}
