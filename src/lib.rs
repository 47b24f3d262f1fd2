pub mod args;
pub mod bridge;
pub mod config;
pub mod cookies;
pub mod error;
pub mod jar;
pub mod rate_limit;
pub mod server;
pub mod tool;

pub use config::Config;
pub use error::{ApiError, DownloadError};
pub use server::{AppState, build_router};

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::{
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        time::Duration,
    };

    use crate::tool::executable_name;

    /// Writes an executable shell script standing in for the download tool.
    pub fn stub_tool(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(executable_name("yt-dlp"));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub async fn wait_until_removed(path: &Path, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        !path.exists()
    }

    pub fn jar_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("cookies_"))
            })
            .collect()
    }
}
