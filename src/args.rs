use std::path::Path;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36";
pub const REFERER: &str = "https://www.youtube.com/";
pub const STDOUT_MARKER: &str = "-";

/// Ordered argv for one tool invocation. The URL is always the last element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentVector(Vec<String>);

impl ArgumentVector {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

pub fn is_audio_alias(format: Option<&str>) -> bool {
    format.is_some_and(|value| value.eq_ignore_ascii_case("mp3"))
}

pub fn build_arguments(url: &str, format: Option<&str>, cookie_jar: Option<&Path>) -> ArgumentVector {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--user-agent".to_string(),
        USER_AGENT.to_string(),
        "--referer".to_string(),
        REFERER.to_string(),
    ];

    if let Some(path) = cookie_jar {
        args.push("--cookies".to_string());
        args.push(path.to_string_lossy().into_owned());
    }

    match format.filter(|value| !value.is_empty()) {
        Some(_) if is_audio_alias(format) => {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
        }
        Some(selector) => {
            args.push("-f".to_string());
            args.push(selector.to_string());
        }
        None => {}
    }

    args.push("-o".to_string());
    args.push(STDOUT_MARKER.to_string());
    args.push(url.to_string());

    ArgumentVector(args)
}
