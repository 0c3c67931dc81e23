//! Conda platform subdirectories (`linux-64`, `osx-arm64`, `noarch`, ...).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The platform subdirectories conda-forge builds for.
pub const ALL_PLATFORMS: [&str; 6] = [
    "linux-64",
    "linux-aarch64",
    "linux-ppc64le",
    "osx-64",
    "osx-arm64",
    "win-64",
];

/// Architecture tokens that may follow the platform in a variant config file
/// name. Anything else means the default `64` architecture.
pub const NON_DEFAULT_ARCHES: [&str; 5] = ["32", "aarch64", "ppc64le", "armv7l", "arm64"];

/// A conda subdir such as `linux-64` or `noarch`.
///
/// # Example
///
/// ```
/// use solvable_schema::Subdir;
///
/// let subdir: Subdir = "osx-arm64".parse().unwrap();
/// assert_eq!(subdir.platform(), "osx");
/// assert_eq!(subdir.arch(), Some("arm64"));
/// assert!(subdir.is_unix());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subdir(String);

impl Subdir {
    /// The platform-independent `noarch` subdir.
    pub fn noarch() -> Self {
        Self("noarch".to_string())
    }

    /// Build a subdir from the `{platform}-{arch}` parts.
    pub fn from_parts(platform: &str, arch: &str) -> Self {
        Self(format!("{platform}-{arch}"))
    }

    /// The subdir text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The platform part (`linux`, `osx`, `win`), or `noarch`.
    pub fn platform(&self) -> &str {
        self.0.split_once('-').map_or(self.0.as_str(), |(p, _)| p)
    }

    /// The architecture part, `None` for `noarch`.
    pub fn arch(&self) -> Option<&str> {
        self.0.split_once('-').map(|(_, a)| a)
    }

    /// Whether this is the `noarch` subdir.
    pub fn is_noarch(&self) -> bool {
        self.0 == "noarch"
    }

    /// Whether this is a Windows subdir.
    pub fn is_windows(&self) -> bool {
        self.platform() == "win"
    }

    /// Whether this is a Linux subdir.
    pub fn is_linux(&self) -> bool {
        self.platform() == "linux"
    }

    /// Whether this is a macOS subdir.
    pub fn is_osx(&self) -> bool {
        self.platform() == "osx"
    }

    /// Whether this is a non-Windows platform subdir.
    pub fn is_unix(&self) -> bool {
        !self.is_noarch() && !self.is_windows()
    }
}

impl fmt::Display for Subdir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Subdir {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "noarch" {
            return Ok(Self::noarch());
        }
        match s.split_once('-') {
            Some((platform, arch))
                if !platform.is_empty()
                    && !arch.is_empty()
                    && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') =>
            {
                Ok(Self(s.to_string()))
            }
            _ => Err(format!("Unknown subdir: {s}")),
        }
    }
}

impl TryFrom<String> for Subdir {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subdir> for String {
    fn from(value: Subdir) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subdirs() {
        for name in ALL_PLATFORMS {
            let subdir: Subdir = name.parse().unwrap();
            assert_eq!(subdir.as_str(), name);
        }
        assert!(Subdir::noarch().is_noarch());
        assert!("linux".parse::<Subdir>().is_err());
        assert!("linux 64".parse::<Subdir>().is_err());
    }

    #[test]
    fn test_platform_families() {
        let win: Subdir = "win-64".parse().unwrap();
        assert!(win.is_windows() && !win.is_unix());
        let linux: Subdir = "linux-ppc64le".parse().unwrap();
        assert!(linux.is_linux() && linux.is_unix());
        assert_eq!(linux.arch(), Some("ppc64le"));
        assert!(!Subdir::noarch().is_unix());
    }
}
