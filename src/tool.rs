use std::path::PathBuf;

use crate::error::DownloadError;

/// `yt-dlp` -> `yt-dlp.exe` on Windows, unchanged elsewhere.
pub fn executable_name(base: &str) -> String {
    format!("{base}{}", std::env::consts::EXE_SUFFIX)
}

#[derive(Debug, Clone)]
pub struct ToolLocator {
    bin_dir: PathBuf,
    name: String,
}

impl ToolLocator {
    pub fn new(bin_dir: impl Into<PathBuf>, base_name: &str) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            name: executable_name(base_name),
        }
    }

    fn candidate(&self) -> PathBuf {
        self.bin_dir.join(&self.name)
    }

    pub async fn resolve(&self) -> Result<PathBuf, DownloadError> {
        let path = self.candidate();
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(path),
            _ => Err(DownloadError::ToolNotFound {
                name: self.name.clone(),
                dir: self.bin_dir.clone(),
            }),
        }
    }
}
