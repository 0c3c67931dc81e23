//! Variant configs (`.ci_support/*.yaml`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use solvable_schema::{NON_DEFAULT_ARCHES, Subdir};
use thiserror::Error;

use crate::pins::PinRunAsBuild;

#[derive(Error, Debug)]
pub enum VariantError {
    #[error("failed to read variant config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid variant config {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("variant config {0} is not a mapping")]
    NotAMapping(PathBuf),
}

/// Split a config file stem into `(platform, arch)`.
///
/// conda-smithy names configs `{platform}_{arch}_...`, leaving the arch out
/// of the key it uses when it is `64`; anything that is not a known
/// non-default arch means `64`.
///
/// ```
/// use solvable_core::variant::platform_arch;
///
/// assert_eq!(platform_arch("osx_arm64_python3.12"), ("osx".to_string(), "arm64".to_string()));
/// assert_eq!(platform_arch("linux_64_cuda_compiler_version12.0"), ("linux".to_string(), "64".to_string()));
/// assert_eq!(platform_arch("win_python3.10"), ("win".to_string(), "64".to_string()));
/// ```
pub fn platform_arch(stem: &str) -> (String, String) {
    let mut parts = stem.split('_');
    let platform = parts.next().unwrap_or_default().to_string();
    let arch = parts
        .next()
        .filter(|arch| NON_DEFAULT_ARCHES.contains(arch))
        .unwrap_or("64")
        .to_string();
    (platform, arch)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// One rendering context: a platform, an arch and one cell of the variant
/// matrix.
#[derive(Debug, Clone)]
pub struct VariantConfig {
    /// File stem, e.g. `linux_64_python3.12`.
    pub name: String,
    pub path: PathBuf,
    pub platform: String,
    pub arch: String,
    values: BTreeMap<String, Value>,
}

impl VariantConfig {
    pub fn load(path: &Path) -> Result<Self, VariantError> {
        let text = std::fs::read_to_string(path).map_err(|source| VariantError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(&name, path, &text)
    }

    pub fn parse(name: &str, path: &Path, text: &str) -> Result<Self, VariantError> {
        let value: Value = serde_yaml::from_str(text).map_err(|source| VariantError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        let values = match value {
            Value::Mapping(map) => map
                .into_iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
                .collect(),
            Value::Null => BTreeMap::new(),
            _ => return Err(VariantError::NotAMapping(path.to_path_buf())),
        };
        let (platform, arch) = platform_arch(name);
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            platform,
            arch,
            values,
        })
    }

    /// The subdir the config targets.
    pub fn subdir(&self) -> Subdir {
        Subdir::from_parts(&self.platform, &self.arch)
    }

    /// `{platform}_{arch}`, the key of build platform overrides.
    pub fn platform_key(&self) -> String {
        format!("{}_{}", self.platform, self.arch)
    }

    /// The first value of `key`; variant configs hold one-element lists.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::Sequence(items) => items.first().and_then(scalar_text),
            other => scalar_text(other),
        }
    }

    /// Every scalar-valued key, reduced to its first value.
    pub fn string_map(&self) -> BTreeMap<String, String> {
        self.values
            .keys()
            .filter_map(|k| self.get(k).map(|v| (k.clone(), v)))
            .collect()
    }

    /// The `channel_sources` entries joined with commas, if declared.
    pub fn channel_sources(&self) -> Option<String> {
        let entries: Vec<String> = match self.values.get("channel_sources")? {
            Value::Sequence(items) => items.iter().filter_map(scalar_text).collect(),
            other => scalar_text(other).into_iter().collect(),
        };
        Some(entries.join(","))
    }

    /// `pin_run_as_build` entries. A bare string pins both bounds.
    pub fn pin_run_as_build(&self) -> BTreeMap<String, PinRunAsBuild> {
        let Some(Value::Mapping(map)) = self.values.get("pin_run_as_build") else {
            return BTreeMap::new();
        };
        map.iter()
            .filter_map(|(name, pin)| {
                let name = name.as_str()?.to_string();
                let pin = match pin {
                    Value::String(s) => PinRunAsBuild::both(s),
                    other => serde_yaml::from_value(other.clone()).ok()?,
                };
                Some((name, pin))
            })
            .collect()
    }
}

/// Where a config's build toolchain runs, after applying `overrides`
/// (`{"osx_arm64": "osx_64"}` builds osx-arm64 configs on osx-64).
pub fn build_subdir(variant: &VariantConfig, overrides: &BTreeMap<String, String>) -> Subdir {
    match overrides.get(&variant.platform_key()) {
        Some(key) => {
            let (platform, arch) = key.split_once('_').unwrap_or((key.as_str(), "64"));
            Subdir::from_parts(platform, arch)
        }
        None => variant.subdir(),
    }
}
