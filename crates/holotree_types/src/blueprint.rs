//! Blueprint composition and hashing.
//!
//! A blueprint is the canonical byte form of the effective environment
//! recipe. Its SHA-256 is the primary key for catalogs, spaces and builds,
//! so the serialization here must be byte-identical across platforms and
//! across semantically equivalent recipe orderings.

use std::{
    collections::BTreeMap,
    fmt,
    fmt::{Display, Formatter},
    str::FromStr,
};

use holotree_digest::{compute_bytes_digest, Sha256};
use indexmap::IndexSet;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::recipe::{RecipeError, RecipeFile};

/// The hex SHA-256 of canonical blueprint bytes. Immutable and validated:
/// always exactly 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlueprintHash(String);

/// An error that can occur when parsing a [`BlueprintHash`] from a string.
#[derive(Debug, thiserror::Error, Clone, Eq, PartialEq)]
#[error("'{string}' is not a 64-character lowercase hex digest")]
pub struct ParseBlueprintHashError {
    /// The rejected input.
    pub string: String,
}

impl BlueprintHash {
    /// Hashes canonical blueprint bytes.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Self {
        let digest = compute_bytes_digest::<Sha256>(bytes);
        BlueprintHash(format!("{digest:x}"))
    }

    /// The hex form used in file names.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BlueprintHash {
    type Err = ParseBlueprintHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(BlueprintHash(s.to_owned()))
        } else {
            Err(ParseBlueprintHashError {
                string: s.to_owned(),
            })
        }
    }
}

impl TryFrom<String> for BlueprintHash {
    type Error = ParseBlueprintHashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlueprintHash> for String {
    fn from(hash: BlueprintHash) -> Self {
        hash.0
    }
}

impl Display for BlueprintHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The effective, canonicalized environment recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blueprint {
    /// Channels in priority order, first occurrence wins.
    pub channels: Vec<String>,
    /// Conda spec strings, lexicographically sorted.
    pub conda: Vec<String>,
    /// Pip spec strings, lexicographically sorted.
    pub pip: Vec<String>,
    /// Pre-run scripts in file order.
    pub pre_run: Vec<String>,
    /// Post-install scripts in file order.
    pub post_install: Vec<String>,
    /// Whether dev-dependency blocks were folded in.
    pub dev_dependencies: bool,
}

impl Blueprint {
    /// Composes one or more recipe files into a canonical blueprint.
    ///
    /// Channels keep input order with duplicates removed; dependency sets
    /// are unioned and sorted, with exact pins preferred over range specs
    /// for the same package; scripts are concatenated in file order with
    /// normalized line endings. Dev-dependency blocks participate only when
    /// `dev` is true.
    pub fn compose(files: &[RecipeFile], dev: bool) -> Result<Self, RecipeError> {
        let mut channels = IndexSet::new();
        let mut conda = SpecSet::default();
        let mut pip = SpecSet::default();
        let mut pre_run = Vec::new();
        let mut post_install = Vec::new();

        for file in files {
            let recipe = &file.recipe;
            channels.extend(recipe.channels.iter().cloned());

            for spec in recipe.conda_specs() {
                conda.insert(spec, SpecDialect::Conda)?;
            }
            for spec in recipe.pip_specs().unwrap_or_default() {
                pip.insert(spec, SpecDialect::Pip)?;
            }
            if dev {
                for entry in &recipe.dev_dependencies {
                    match entry.as_spec() {
                        Some(spec) => conda.insert(spec, SpecDialect::Conda)?,
                        None => {
                            if let Some(("pip", specs)) =
                                entry.as_sub_section().map(|(k, v)| (k.as_str(), v))
                            {
                                for spec in specs {
                                    pip.insert(spec, SpecDialect::Pip)?;
                                }
                            }
                        }
                    }
                }
            }

            pre_run.extend(recipe.pre_run.iter().map(|s| normalize_script(s)));
            post_install.extend(recipe.post_install.iter().map(|s| normalize_script(s)));
        }

        Ok(Blueprint {
            channels: channels.into_iter().collect(),
            conda: conda.into_sorted_specs(),
            pip: pip.into_sorted_specs(),
            pre_run,
            post_install,
            dev_dependencies: dev,
        })
    }

    /// The canonical byte serialization: a stable key-ordered YAML-like
    /// form, no comments, trailing newline.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        write_section(&mut out, "channels", &self.channels);
        write_section(&mut out, "conda", &self.conda);
        write_section(&mut out, "pip", &self.pip);
        write_section(&mut out, "pre-run", &self.pre_run);
        write_section(&mut out, "post-install", &self.post_install);
        out.into_bytes()
    }

    /// The blueprint hash: hex SHA-256 of [`Self::canonical_bytes`].
    pub fn hash(&self) -> BlueprintHash {
        BlueprintHash::from_canonical_bytes(&self.canonical_bytes())
    }

    /// Renders the effective recipe back into [`Recipe`] form, e.g. to hand
    /// a single `conda.yaml` to the toolchain or to embed in a bundle.
    pub fn to_recipe(&self) -> crate::Recipe {
        let mut dependencies: Vec<crate::SpecOrSubSection> = self
            .conda
            .iter()
            .cloned()
            .map(crate::SpecOrSubSection::Spec)
            .collect();
        if !self.pip.is_empty() {
            dependencies.push(crate::SpecOrSubSection::SubSection(
                "pip".to_owned(),
                self.pip.clone(),
            ));
        }
        crate::Recipe {
            name: None,
            channels: self.channels.clone(),
            dependencies,
            pre_run: self.pre_run.clone(),
            post_install: self.post_install.clone(),
            dev_dependencies: Vec::new(),
        }
    }
}

fn write_section(out: &mut String, key: &str, values: &[String]) {
    if values.is_empty() {
        out.push_str(key);
        out.push_str(": []\n");
        return;
    }
    out.push_str(key);
    out.push_str(":\n");
    for value in values {
        out.push_str("- ");
        out.push_str(value);
        out.push('\n');
    }
}

/// Normalizes a script: CRLF/CR to LF, trailing whitespace trimmed per line.
fn normalize_script(script: &str) -> String {
    script
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(str::trim_end)
        .join("\n")
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum SpecDialect {
    Conda,
    Pip,
}

/// The union of dependency specs for one dialect, keyed by package name.
#[derive(Default)]
struct SpecSet {
    packages: BTreeMap<String, PackageSpecs>,
}

#[derive(Default)]
struct PackageSpecs {
    /// A normalized exact pin, when one occurred.
    pin: Option<String>,
    /// Range or bare specs, kept verbatim.
    ranges: IndexSet<String>,
}

impl SpecSet {
    fn insert(&mut self, raw: &str, dialect: SpecDialect) -> Result<(), RecipeError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(());
        }
        let name = package_name(raw);
        let entry = self.packages.entry(name.clone()).or_default();
        match exact_pin(raw, dialect) {
            Some(version) => {
                let normalized = match dialect {
                    SpecDialect::Conda => format!("{name}={version}"),
                    SpecDialect::Pip => format!("{name}=={version}"),
                };
                if let Some(existing) = &entry.pin {
                    if existing != &normalized {
                        return Err(RecipeError::ConflictingPin {
                            pkg: name,
                            a: existing.clone(),
                            b: normalized,
                        });
                    }
                } else {
                    entry.pin = Some(normalized);
                }
            }
            None => {
                entry.ranges.insert(raw.to_owned());
            }
        }
        Ok(())
    }

    /// Flattens to the canonical sorted spec list. A package with an exact
    /// pin contributes only the pin; range specs for it are dropped.
    fn into_sorted_specs(self) -> Vec<String> {
        self.packages
            .into_values()
            .flat_map(|specs| match specs.pin {
                Some(pin) => vec![pin],
                None => specs.ranges.into_iter().collect(),
            })
            .sorted()
            .collect()
    }
}

/// Extracts the lowercased package name from a spec string.
fn package_name(spec: &str) -> String {
    spec.split(|c: char| "<>=!~ ;[".contains(c))
        .next()
        .unwrap_or(spec)
        .trim()
        .to_lowercase()
}

/// Returns the pinned version when a spec is an exact pin (`name=1.2` or
/// `name==1.2` for conda, `name==1.2` for pip). Wildcards and compound
/// constraints are ranges.
fn exact_pin(spec: &str, dialect: SpecDialect) -> Option<String> {
    if spec.contains(['*', ',', '<', '>', '!', '~', '[', ';']) {
        return None;
    }
    let (name_part, version) = match spec.split_once("==") {
        Some((name, version)) => (name, version),
        None => match dialect {
            SpecDialect::Conda => spec.split_once('=')?,
            SpecDialect::Pip => return None,
        },
    };
    let version = version.trim();
    if name_part.trim().is_empty() || version.is_empty() || version.contains('=') {
        return None;
    }
    Some(version.to_owned())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rstest::rstest;

    use super::*;
    use crate::recipe::Recipe;

    fn recipe_file(yaml: &str) -> RecipeFile {
        RecipeFile {
            path: "conda.yaml".into(),
            recipe: Recipe::from_yaml_str(yaml).unwrap(),
        }
    }

    #[test]
    fn hash_is_stable_under_dependency_reordering() {
        let a = recipe_file(
            "channels: [a, b]\ndependencies:\n  - numpy=1.24\n  - pandas\n",
        );
        let b = recipe_file(
            "channels: [a, b]\ndependencies:\n  - pandas\n  - numpy=1.24\n",
        );
        let hash_a = Blueprint::compose(&[a], false).unwrap().hash();
        let hash_b = Blueprint::compose(&[b], false).unwrap().hash();
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn channels_keep_first_occurrence_order() {
        let a = recipe_file("channels: [conda-forge, bioconda]");
        let b = recipe_file("channels: [bioconda, defaults]");
        let blueprint = Blueprint::compose(&[a, b], false).unwrap();
        assert_eq!(blueprint.channels, vec!["conda-forge", "bioconda", "defaults"]);
    }

    #[test]
    fn exact_pin_wins_over_range() {
        let file = recipe_file(
            "dependencies:\n  - 'numpy>=1.20'\n  - numpy=1.24\n",
        );
        let blueprint = Blueprint::compose(&[file], false).unwrap();
        assert_eq!(blueprint.conda, vec!["numpy=1.24"]);
    }

    #[test]
    fn conflicting_pins_are_rejected() {
        let file = recipe_file(
            "dependencies:\n  - numpy=1.24\n  - numpy==1.25\n",
        );
        let err = Blueprint::compose(&[file], false).unwrap_err();
        assert_matches!(err, RecipeError::ConflictingPin { pkg, .. } if pkg == "numpy");
    }

    #[test]
    fn equivalent_pin_spellings_do_not_conflict() {
        let file = recipe_file(
            "dependencies:\n  - numpy=1.24\n  - numpy==1.24\n",
        );
        let blueprint = Blueprint::compose(&[file], false).unwrap();
        assert_eq!(blueprint.conda, vec!["numpy=1.24"]);
    }

    #[test]
    fn dev_dependencies_participate_only_when_enabled() {
        let file = recipe_file(
            "dependencies:\n  - python=3.10\ndev-dependencies:\n  - pytest\n",
        );
        let plain = Blueprint::compose(std::slice::from_ref(&file), false).unwrap();
        let dev = Blueprint::compose(&[file], true).unwrap();
        assert_eq!(plain.conda, vec!["python=3.10"]);
        assert_eq!(dev.conda, vec!["pytest", "python=3.10"]);
        assert_ne!(plain.hash(), dev.hash());
    }

    #[test]
    fn scripts_keep_order_and_normalize_line_endings() {
        let a = recipe_file("pre-run:\n  - \"first \"\n");
        let b = recipe_file("pre-run:\n  - \"second\\r\\n\"\n");
        let blueprint = Blueprint::compose(&[a, b], false).unwrap();
        assert_eq!(blueprint.pre_run, vec!["first", "second\n"]);
    }

    #[test]
    fn canonical_bytes_end_with_newline() {
        let blueprint = Blueprint::compose(&[], false).unwrap();
        let bytes = blueprint.canonical_bytes();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "channels: []\nconda: []\npip: []\npre-run: []\npost-install: []\n"
        );
    }

    #[rstest]
    #[case("numpy=1.24", Some("1.24"))]
    #[case("numpy==1.24", Some("1.24"))]
    #[case("numpy>=1.24", None)]
    #[case("numpy=1.24.*", None)]
    #[case("numpy", None)]
    fn conda_pin_detection(#[case] spec: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            exact_pin(spec, SpecDialect::Conda).as_deref(),
            expected
        );
    }

    #[rstest]
    #[case("requests==2.31.0", Some("2.31.0"))]
    #[case("requests>=2.0", None)]
    #[case("requests", None)]
    fn pip_pin_detection(#[case] spec: &str, #[case] expected: Option<&str>) {
        assert_eq!(exact_pin(spec, SpecDialect::Pip).as_deref(), expected);
    }

    #[test]
    fn blueprint_hash_parse_round_trip() {
        let hash = Blueprint::compose(&[], false).unwrap().hash();
        let parsed: BlueprintHash = hash.as_str().parse().unwrap();
        assert_eq!(hash, parsed);
        assert!("NOTAHASH".parse::<BlueprintHash>().is_err());
    }
}
