//! Channel names and URLs.

use solvable_schema::Subdir;

use crate::config::SolvableConfig;

/// Channel sources used when a variant config does not declare any.
pub const DEFAULT_CHANNEL_SOURCES: [&str; 3] = ["conda-forge", "defaults", "msys2"];

const ANACONDA_HOST: &str = "https://conda.anaconda.org";
const ANACONDA_STATIC_HOST: &str = "https://conda-static.anaconda.org";

/// The ordered channel list for one variant.
///
/// `declared` is the variant's `channel_sources` entry (comma separated).
/// `msys2` is always present and additional channels rank first.
pub fn channel_sources(declared: Option<&str>, additional: &[String]) -> Vec<String> {
    let mut sources: Vec<String> = match declared {
        Some(text) => text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => DEFAULT_CHANNEL_SOURCES.iter().map(ToString::to_string).collect(),
    };
    if !sources.iter().any(|s| s == "msys2") {
        sources.push("msys2".to_string());
    }
    additional.iter().cloned().chain(sources).collect()
}

fn is_url(name: &str) -> bool {
    name.contains("://")
}

/// Expand one channel name into base URLs for `subdir`.
///
/// Bare names resolve against the channel alias, `defaults` expands to the
/// default channels (plus msys2 on Windows) and `msys2` to the msys2 channel.
pub fn resolve_channel(name: &str, subdir: &Subdir, config: &SolvableConfig) -> Vec<String> {
    let name = name.trim().trim_end_matches('/');
    match name {
        "defaults" => {
            let mut urls = config.default_channels.clone();
            if subdir.is_windows() {
                urls.push(config.msys2_channel.clone());
            }
            urls
        }
        "msys2" => vec![config.msys2_channel.clone()],
        _ if is_url(name) => vec![name.to_string()],
        _ => vec![format!(
            "{}/{name}",
            config.channel_alias.trim_end_matches('/')
        )],
    }
}

/// Resolve a channel list, dropping duplicates but keeping priority order.
pub fn resolve_channels<S: AsRef<str>>(
    names: &[S],
    subdir: &Subdir,
    config: &SolvableConfig,
) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for name in names {
        for url in resolve_channel(name.as_ref(), subdir, config) {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    urls
}

/// The canonical form of a channel URL used for cache keys and downloads.
///
/// Anaconda tokens (`/t/<token>`) are stripped and `conda.anaconda.org` is
/// served from its static mirror.
///
/// ```
/// use solvable_core::channel::canonicalize_url;
///
/// assert_eq!(
///     canonicalize_url("https://conda.anaconda.org/t/abc123/conda-forge/"),
///     "https://conda-static.anaconda.org/conda-forge"
/// );
/// ```
pub fn canonicalize_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    let mut parts: Vec<&str> = url.split('/').collect();
    if let Some(pos) = parts.iter().position(|p| *p == "t") {
        // Only strip when it looks like `host/t/<token>/...`.
        if pos == 3 && parts.len() > pos + 1 {
            parts.drain(pos..=pos + 1);
        }
    }
    let url = parts.join("/");
    match url.strip_prefix(ANACONDA_HOST) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            format!("{ANACONDA_STATIC_HOST}{rest}")
        }
        _ => url,
    }
}

/// The last path component of a channel URL (`conda-forge`).
pub fn channel_name(url: &str) -> &str {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
}

/// Split a full `{channel}/{subdir}` URL into the channel and subdir.
pub fn split_subdir_url(url: &str) -> Option<(&str, Subdir)> {
    let url = url.trim_end_matches('/');
    let (channel, subdir) = url.rsplit_once('/')?;
    let subdir = subdir.parse().ok()?;
    Some((channel, subdir))
}
