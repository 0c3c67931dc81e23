//! `meta.yaml` rendering.

use std::collections::BTreeMap;

use serde_yaml::Value;
use solvable_schema::Subdir;

use super::jinja::{Call, Jinja};
use super::selectors::{Namespace, apply_selectors};
use super::{RECIPE_FILE, RecipeOutput, RecipeRenderer, RenderError, RenderRequest};
use crate::pins::{DEFAULT_MAX_PIN, DEFAULT_MIN_PIN, apply_pin_expressions};
use crate::requirements::RequirementSet;

const REQUIREMENT_SECTIONS: [&str; 4] = ["build", "host", "run", "run_constrained"];

fn default_compiler(language: &str, target: &Subdir) -> String {
    let platform = target.platform();
    match (language, platform) {
        ("c", "osx") => "clang",
        ("cxx", "osx") => "clangxx",
        ("c" | "cxx", "win") => "vs2017",
        ("c", _) => "gcc",
        ("cxx", _) => "gxx",
        ("fortran", _) => "gfortran",
        (other, _) => other,
    }
    .to_string()
}

fn default_stdlib(target: &Subdir) -> &'static str {
    match target.platform() {
        "osx" => "macosx_deployment_target",
        "win" => "vs",
        _ => "sysroot",
    }
}

fn cdt_arch(target: &Subdir) -> &str {
    match target.arch() {
        Some("64") => "x86_64",
        Some("32") => "i686",
        Some(arch) => arch,
        None => "noarch",
    }
}

/// The conda-build functions requirement sections call.
struct RecipeFunctions<'a> {
    target: &'a Subdir,
    variant: &'a BTreeMap<String, String>,
    version: String,
}

impl RecipeFunctions<'_> {
    fn tool(&self, kind: &str, language: &str, default: String) -> String {
        let name = self
            .variant
            .get(&format!("{language}_{kind}"))
            .cloned()
            .unwrap_or(default);
        let mut out = format!("{name}_{}", self.target);
        if let Some(version) = self.variant.get(&format!("{language}_{kind}_version")) {
            out.push(' ');
            out.push_str(version);
        }
        out
    }

    fn call(&self, call: &Call<'_>) -> Option<String> {
        match call.name {
            "compiler" => {
                let language = call.arg(0, "language")?;
                Some(self.tool("compiler", language, default_compiler(language, self.target)))
            }
            "stdlib" => {
                let language = call.arg(0, "language")?;
                Some(self.tool("stdlib", language, default_stdlib(self.target).to_string()))
            }
            // Evaluated later against the solved host or build environment.
            "pin_compatible" => Some(call.to_source()),
            "pin_subpackage" => {
                let name = call.arg(0, "subpackage_name")?;
                let exact = call
                    .arg(3, "exact")
                    .is_some_and(|e| e.eq_ignore_ascii_case("true"));
                if self.version.is_empty() {
                    return Some(name.to_string());
                }
                if exact {
                    return Some(format!("{name} {}", self.version));
                }
                let min_pin = call.arg(1, "min_pin").unwrap_or(DEFAULT_MIN_PIN);
                let max_pin = call.arg(2, "max_pin").unwrap_or(DEFAULT_MAX_PIN);
                Some(match apply_pin_expressions(&self.version, Some(min_pin), Some(max_pin)) {
                    Ok(range) => format!("{name} {range}"),
                    Err(_) => name.to_string(),
                })
            }
            "cdt" => {
                let name = call.arg(0, "package_name")?;
                let cdt_name = self.variant.get("cdt_name").map_or("cos6", String::as_str);
                Some(format!("{name}-{cdt_name}-{}", cdt_arch(self.target)))
            }
            _ => None,
        }
    }
}

fn lookup<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A requirement list; a single scalar counts as a one-element list.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(items)) => items.iter().filter_map(scalar).collect(),
        Some(other) => scalar(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn truthy(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
        _ => None,
    }
}

/// Pin bare requirements that name a variant key to the variant's value.
fn pin_to_variant(specs: Vec<String>, variant: &BTreeMap<String, String>) -> RequirementSet {
    specs
        .into_iter()
        .map(|spec| {
            let trimmed = spec.trim();
            if trimmed.contains(char::is_whitespace) {
                return spec;
            }
            let value = variant
                .get(trimmed)
                .or_else(|| variant.get(&trimmed.replace('-', "_")));
            match value {
                Some(value) => format!("{trimmed} {value}"),
                None => spec,
            }
        })
        .collect()
}

/// Renders `recipe/meta.yaml` for one variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaYamlRenderer;

impl MetaYamlRenderer {
    /// Selectors, then Jinja, then selectors again on what Jinja produced.
    pub fn render_text(&self, text: &str, request: &RenderRequest<'_>) -> Result<String, RenderError> {
        let mut variant = request.variant.string_map();
        variant.insert("target_platform".to_string(), request.target.to_string());
        variant.insert("build_platform".to_string(), request.build.to_string());
        if let Some(python) = variant.get("python").and_then(|p| p.split_whitespace().next()) {
            let py_ver: Vec<&str> = python.split('.').take(2).collect();
            variant.insert("PY_VER".to_string(), py_ver.join("."));
        }

        let ns = Namespace::for_target(request.target, request.build, &variant);
        let selected = apply_selectors(text, &ns)?;

        let version = Self::prerender_version(&selected, &variant)?;
        let functions = RecipeFunctions {
            target: request.target,
            variant: &variant,
            version,
        };
        let table = |call: &Call<'_>| functions.call(call);
        let mut jinja = Jinja::new(variant.clone(), &table);
        let rendered = jinja.render(&selected)?;
        apply_selectors(&rendered, &ns)
    }

    /// The package version, needed by `pin_subpackage` before the full
    /// render. Rendering with an empty function table is enough for it.
    fn prerender_version(text: &str, variant: &BTreeMap<String, String>) -> Result<String, RenderError> {
        let none = |_: &Call<'_>| None;
        let mut jinja = Jinja::new(variant.clone(), &none);
        let rendered = jinja.render(text)?;
        let version = serde_yaml::from_str::<Value>(&rendered)
            .ok()
            .and_then(|v| lookup(&v, &["package", "version"]).and_then(scalar));
        Ok(version.unwrap_or_default())
    }

    fn output(
        &self,
        node: &Value,
        root: &Value,
        request: &RenderRequest<'_>,
        variant: &BTreeMap<String, String>,
        uses_compilers: bool,
    ) -> Result<RecipeOutput, RenderError> {
        let name = node
            .get("name")
            .or_else(|| lookup(node, &["package", "name"]))
            .and_then(scalar)
            .ok_or_else(|| RenderError::Invalid("output without a name".to_string()))?;
        let version = node
            .get("version")
            .or_else(|| lookup(node, &["package", "version"]))
            .or_else(|| lookup(root, &["package", "version"]))
            .and_then(scalar)
            .unwrap_or_default();

        // An output without a requirements block builds with the top level's.
        let requirements = match node.get("requirements") {
            Some(Value::Sequence(run)) => {
                let mut map = serde_yaml::Mapping::new();
                map.insert(Value::from("run"), Value::Sequence(run.clone()));
                Value::Mapping(map)
            }
            Some(other) => other.clone(),
            None => root.get("requirements").cloned().unwrap_or(Value::Null),
        };
        let [build, host, run, run_constrained] =
            REQUIREMENT_SECTIONS.map(|section| string_list(requirements.get(section)));
        let has_host = requirements.get("host").is_some();

        let build_section = node.get("build");
        let root_build = root.get("build");
        let inherited = |key: &str| {
            build_section
                .and_then(|b| b.get(key))
                .or_else(|| root_build.and_then(|b| b.get(key)))
        };

        let noarch_kind = build_section.and_then(|b| b.get("noarch")).and_then(scalar);
        let noarch = noarch_kind.as_deref().is_some_and(|k| k == "python" || k == "generic");
        let noarch_python = noarch_kind.as_deref() == Some("python")
            || truthy(build_section.and_then(|b| b.get("noarch_python"))).unwrap_or(false);

        let subdirs_same = request.target == request.build;
        let merge_build_host = truthy(inherited("merge_build_host"));
        let build_is_host = merge_build_host == Some(true)
            || (subdirs_same && merge_build_host != Some(false) && !has_host && !uses_compilers);

        let test = node.get("test");
        let mut tests = string_list(test.and_then(|t| t.get("requires")));
        tests.extend(string_list(test.and_then(|t| t.get("requirements"))));

        Ok(RecipeOutput {
            name,
            version,
            is_cross: has_host || !subdirs_same,
            noarch,
            noarch_python,
            build_is_host,
            build: pin_to_variant(build, variant),
            host: pin_to_variant(host, variant),
            run: run.into_iter().collect(),
            run_constrained: run_constrained.into_iter().collect(),
            test: tests.into_iter().collect(),
            ignore_run_exports: string_list(inherited("ignore_run_exports")),
            ignore_run_exports_from: string_list(inherited("ignore_run_exports_from")),
        })
    }
}

impl RecipeRenderer for MetaYamlRenderer {
    fn render(&self, request: &RenderRequest<'_>) -> Result<Vec<RecipeOutput>, RenderError> {
        let path = request.recipe_dir.join(RECIPE_FILE);
        if !path.is_file() {
            return Err(RenderError::MissingRecipe(path));
        }
        let text = std::fs::read_to_string(&path).map_err(|source| RenderError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(
            "rendering {} for {} (build {}) with channels {:?}",
            path.display(),
            request.target,
            request.build,
            request.channel_urls
        );

        let rendered = self.render_text(&text, request)?;
        let root: Value = serde_yaml::from_str(&rendered).map_err(|source| RenderError::Yaml {
            path: path.clone(),
            source,
        })?;
        if !root.is_mapping() {
            return Err(RenderError::Invalid(format!("{} is not a mapping", path.display())));
        }

        let variant = request.variant.string_map();
        let uses_compilers = text.contains("compiler(");
        match root.get("outputs").and_then(Value::as_sequence) {
            Some(outputs) if !outputs.is_empty() => outputs
                .iter()
                .map(|node| self.output(node, &root, request, &variant, uses_compilers))
                .collect(),
            _ => Ok(vec![self.output(&root, &root, request, &variant, uses_compilers)?]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::VariantConfig;
    use std::path::Path;

    const RECIPE: &str = r#"
{% set name = "libfoo" %}
{% set version = "1.2.3" %}

package:
  name: {{ name }}
  version: {{ version }}

build:
  number: 0
  ignore_run_exports_from:
    - {{ compiler('cxx') }}

requirements:
  build:
    - {{ compiler('c') }}
    - {{ stdlib('c') }}
    - cmake
    - m2-make  # [win]
  host:
    - python
    - numpy
    - zlib
  run:
    - python
    - {{ pin_compatible('numpy', max_pin='x.x') }}
    - __osx >={{ MACOSX_DEPLOYMENT_TARGET|default('10.13') }}  # [osx and x86_64]
  run_constrained:
    - libbar >=2

test:
  requires:
    - pytest
"#;

    const CBC: &str = "c_compiler:\n- gcc\nc_compiler_version:\n- '13'\nc_stdlib_version:\n- '2.17'\npython:\n- 3.12.* *_cpython\nnumpy:\n- '2.0'\n";

    fn render(recipe: &str, target: &str, build: &str) -> Result<Vec<RecipeOutput>, RenderError> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RECIPE_FILE), recipe).unwrap();
        let name = format!("{}_", target.replace('-', "_"));
        let variant = VariantConfig::parse(&name, Path::new("cbc.yaml"), CBC).unwrap();
        let target: Subdir = target.parse().unwrap();
        let build: Subdir = build.parse().unwrap();
        MetaYamlRenderer.render(&RenderRequest {
            recipe_dir: dir.path(),
            target: &target,
            build: &build,
            variant: &variant,
            channel_urls: &[],
        })
    }

    #[test]
    fn test_single_output() {
        let outputs = render(RECIPE, "linux-64", "linux-64").unwrap();
        assert_eq!(outputs.len(), 1);
        let out = &outputs[0];
        assert_eq!(out.name, "libfoo");
        assert_eq!(out.version, "1.2.3");
        assert_eq!(
            out.build.to_vec(),
            vec!["gcc_linux-64 13", "sysroot_linux-64 2.17", "cmake"]
        );
        assert_eq!(
            out.host.to_vec(),
            vec!["python 3.12.* *_cpython", "numpy 2.0", "zlib"]
        );
        assert_eq!(
            out.run.to_vec(),
            vec!["python", "pin_compatible('numpy', max_pin='x.x')"]
        );
        assert_eq!(out.run_constrained.to_vec(), vec!["libbar >=2"]);
        assert_eq!(out.test.to_vec(), vec!["pytest"]);
        assert_eq!(out.ignore_run_exports_from, vec!["gxx_linux-64"]);
        assert!(out.is_cross);
        assert!(!out.build_is_host);
        assert!(!out.is_noarch());
    }

    #[test]
    fn test_platform_selectors() {
        let win = render(RECIPE, "win-64", "win-64").unwrap();
        assert!(win[0].build.contains_name("m2-make"));
        assert!(win[0].build.contains_name("gcc_win-64"));
        assert_eq!(win[0].ignore_run_exports_from, vec!["vs2017_win-64"]);

        let osx = render(RECIPE, "osx-64", "osx-64").unwrap();
        assert!(osx[0].run.iter().any(|r| r == "__osx >=10.13"));
        assert!(!osx[0].build.contains_name("m2-make"));
    }

    #[test]
    fn test_outputs_and_noarch() {
        let recipe = r"
package:
  name: foo-split
  version: 2.0.1
requirements:
  build:
    - make
outputs:
  - name: libfoo
    requirements:
      host:
        - zlib
      run:
        - zlib
  - name: foo
    build:
      noarch: python
    requirements:
      - python
      - {{ pin_subpackage('libfoo', max_pin='x.x') }}
  - name: foo-tools
";
        let outputs = render(recipe, "linux-64", "linux-64").unwrap();
        let names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["libfoo", "foo", "foo-tools"]);

        assert_eq!(outputs[0].host.to_vec(), vec!["zlib"]);
        assert!(outputs[1].noarch && outputs[1].noarch_python);
        assert_eq!(
            outputs[1].run.to_vec(),
            vec!["python", "libfoo >=2.0.1,<2.1.0a0"]
        );
        assert!(outputs[1].build_is_host);
        assert_eq!(outputs[2].build.to_vec(), vec!["make"]);
        assert_eq!(outputs[2].version, "2.0.1");
    }

    #[test]
    fn test_cross_build_flags() {
        let recipe = "package:\n  name: tool\n  version: 1.0\nrequirements:\n  build:\n    - make\n  run:\n    - libc\n";
        let native = render(recipe, "linux-64", "linux-64").unwrap();
        assert!(native[0].build_is_host);
        assert!(!native[0].is_cross);

        let cross = render(recipe, "osx-arm64", "osx-64").unwrap();
        assert!(cross[0].is_cross);
        assert!(!cross[0].build_is_host);
    }

    #[test]
    fn test_missing_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let variant = VariantConfig::parse("linux_64_", Path::new("cbc.yaml"), "").unwrap();
        let subdir: Subdir = "linux-64".parse().unwrap();
        let err = MetaYamlRenderer
            .render(&RenderRequest {
                recipe_dir: dir.path(),
                target: &subdir,
                build: &subdir,
                variant: &variant,
                channel_urls: &[],
            })
            .unwrap_err();
        assert!(matches!(err, RenderError::MissingRecipe(_)));
    }
}
