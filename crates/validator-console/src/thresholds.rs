use std::io;
use std::path::Path;

const DEFAULT_URL_KEY: &str = "DEFAULT_URL";

/// Reads `DEFAULT_URL` from the validator's shell-style settings file.
/// A missing file or key yields an empty string, which the dashboard shows as no hint.
pub(crate) async fn read_default_url(path: &Path) -> io::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(setting(&raw, DEFAULT_URL_KEY).unwrap_or_default()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}

/// First `KEY=value` assignment for `key`, with inline comments and quotes removed.
fn setting(raw: &str, key: &str) -> Option<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(name, _)| name.trim() == key)
        .map(|(_, value)| {
            let value = value.split('#').next().unwrap_or_default().trim();
            value
                .trim_matches('"')
                .trim_matches('\'')
                .to_string()
        })
}
