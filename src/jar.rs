use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, warn};

pub(crate) const JAR_PREFIX: &str = "cookies_";
pub(crate) const JAR_SUFFIX: &str = ".txt";

/// Removes its file on `release`, or on drop if `release` was never reached.
#[derive(Debug)]
pub struct CookieJar {
    path: PathBuf,
    released: bool,
}

impl CookieJar {
    pub(crate) fn adopt(path: PathBuf) -> Self {
        Self {
            path,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn release(mut self) {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Archivo de cookies {:?} eliminado.", self.path),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                warn!("El archivo de cookies {:?} ya no existia.", self.path);
            }
            Err(error) => {
                warn!("Error al eliminar archivo de cookies {:?}: {error}", self.path);
            }
        }
    }
}

impl Drop for CookieJar {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Err(error) = std::fs::remove_file(&self.path)
            && error.kind() != ErrorKind::NotFound
        {
            warn!("Error al eliminar archivo de cookies {:?}: {error}", self.path);
        }
    }
}

fn is_jar_file_name(name: &str) -> bool {
    name.starts_with(JAR_PREFIX) && name.ends_with(JAR_SUFFIX)
}

/// Startup only: a live tool may still be reading a recent jar.
pub async fn sweep_stale(dir: &Path, older_than: Duration) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("No se pudo abrir carpeta temporal para limpieza: {error}");
            }
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("No se pudo iterar carpeta temporal para limpieza: {error}");
                break;
            }
        };

        if !entry.file_name().to_str().is_some_and(is_jar_file_name) {
            continue;
        }

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(error) => {
                warn!("No se pudo leer metadata de {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("No se pudo eliminar archivo temporal {:?}: {error}", path),
        }
    }

    removed
}
