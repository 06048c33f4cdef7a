//! Declarative environment recipes (`conda.yaml`).
//!
//! A recipe lists channels, conda dependencies, an optional `pip:`
//! subsection, pre-run and post-install scripts and an optional
//! `dev-dependencies` block. One or more recipes are composed into a
//! [`crate::Blueprint`].

use std::path::{Path, PathBuf};

use serde::{
    de::{Error as _, MapAccess, Visitor},
    ser::SerializeMap,
    Deserializer, Serializer,
};

/// A parsed `conda.yaml` recipe file.
#[derive(Default, Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Recipe {
    /// The preferred name for the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Channels used to resolve conda dependencies, in priority order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,

    /// Conda spec strings, or a subsection of specs for another package
    /// manager (`pip:`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<SpecOrSubSection>,

    /// Scripts executed before every run of the environment, in order.
    #[serde(default, rename = "pre-run", skip_serializing_if = "Vec::is_empty")]
    pub pre_run: Vec<String>,

    /// Scripts executed once after the environment is built, in order.
    #[serde(
        default,
        rename = "post-install",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub post_install: Vec<String>,

    /// Additional dependencies included only when dev mode is requested.
    #[serde(
        default,
        rename = "dev-dependencies",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub dev_dependencies: Vec<SpecOrSubSection>,
}

/// A conda spec string or a named subsection (in practice only `pip`), as
/// part of the `dependencies` section of a recipe.
#[derive(Debug, Clone, PartialEq)]
pub enum SpecOrSubSection {
    /// A conda package spec string.
    Spec(String),
    /// A list of specs for another package manager (pip).
    SubSection(String, Vec<String>),
}

impl SpecOrSubSection {
    /// Returns the conda spec if this is one, or `None` otherwise.
    pub fn as_spec(&self) -> Option<&str> {
        match self {
            SpecOrSubSection::Spec(s) => Some(s),
            SpecOrSubSection::SubSection(_, _) => None,
        }
    }

    /// Returns the subsection if this is one, or `None` otherwise.
    pub fn as_sub_section(&self) -> Option<(&String, &Vec<String>)> {
        match self {
            SpecOrSubSection::Spec(_) => None,
            SpecOrSubSection::SubSection(key, specs) => Some((key, specs)),
        }
    }
}

impl Recipe {
    /// Returns all conda spec strings in the `dependencies` section.
    pub fn conda_specs(&self) -> impl Iterator<Item = &'_ str> + '_ {
        self.dependencies.iter().filter_map(SpecOrSubSection::as_spec)
    }

    /// Returns the subsection with the given name or `None` if no such
    /// subsection exists.
    pub fn find_sub_section(&self, name: &str) -> Option<&[String]> {
        self.dependencies
            .iter()
            .filter_map(SpecOrSubSection::as_sub_section)
            .find_map(|(subsection_name, specs)| {
                (subsection_name == name).then_some(specs.as_slice())
            })
    }

    /// Returns the `pip` subsection.
    pub fn pip_specs(&self) -> Option<&[String]> {
        self.find_sub_section("pip")
    }

    /// Reads the contents of a file at the given path and parses it as a
    /// recipe.
    pub fn from_path(path: &Path) -> Result<Self, RecipeError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RecipeError::Io(path.to_path_buf(), e))?;
        Self::from_yaml_str(&contents).map_err(|e| RecipeError::InvalidRecipe {
            file: path.to_path_buf(),
            line: e.location().map(|l| l.line()).unwrap_or(0),
            message: e.to_string(),
        })
    }

    /// Parses a recipe from a YAML string.
    pub fn from_yaml_str(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    /// Converts this recipe back to a YAML string.
    pub fn to_yaml_string(&self) -> String {
        serde_yaml::to_string(&self).unwrap_or_default()
    }
}

/// A recipe together with the path it was read from, for error reporting and
/// deterministic composition order.
#[derive(Debug, Clone)]
pub struct RecipeFile {
    /// Where the recipe was read from.
    pub path: PathBuf,
    /// The parsed recipe.
    pub recipe: Recipe,
}

impl RecipeFile {
    /// Reads and parses a recipe file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RecipeError> {
        let path = path.into();
        let recipe = Recipe::from_path(&path)?;
        Ok(RecipeFile { path, recipe })
    }
}

/// Errors produced while reading recipes or composing blueprints.
#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    /// The recipe file could not be read.
    #[error("failed to read recipe '{0}'")]
    Io(PathBuf, #[source] std::io::Error),

    /// The recipe file is not valid YAML or violates the recipe schema.
    #[error("invalid recipe '{file}' at line {line}: {message}")]
    InvalidRecipe {
        /// The offending file.
        file: PathBuf,
        /// Line of the first problem (0 when unknown).
        line: usize,
        /// Parser message.
        message: String,
    },

    /// Two recipes pin the same package to different exact versions.
    #[error("conflicting pins for package '{pkg}': '{a}' vs '{b}'")]
    ConflictingPin {
        /// The package both pins name.
        pkg: String,
        /// The first pin encountered.
        a: String,
        /// The conflicting pin.
        b: String,
    },
}

impl<'a> serde::Deserialize<'a> for SpecOrSubSection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'a>,
    {
        serde_untagged::UntaggedEnumVisitor::new()
            .string(|v| Ok(SpecOrSubSection::Spec(v.to_owned())))
            .map(|v| {
                struct SubSectionVisitor;

                impl<'a> Visitor<'a> for SubSectionVisitor {
                    type Value = SpecOrSubSection;

                    fn expecting(
                        &self,
                        formatter: &mut std::fmt::Formatter<'_>,
                    ) -> std::fmt::Result {
                        formatter.write_str("a list of strings")
                    }

                    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
                    where
                        A: MapAccess<'a>,
                    {
                        let (key, value) = map
                            .next_entry()?
                            .ok_or_else(|| A::Error::custom("expected a map entry"))?;
                        if map.next_key::<String>()?.is_some() {
                            return Err(A::Error::custom("expected a map with a single entry"));
                        }
                        Ok(SpecOrSubSection::SubSection(key, value))
                    }
                }

                SubSectionVisitor.visit_map(v)
            })
            .deserialize(deserializer)
    }
}

impl serde::Serialize for SpecOrSubSection {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            SpecOrSubSection::Spec(spec) => spec.serialize(serializer),
            SpecOrSubSection::SubSection(key, value) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(key, value)?;
                map.end()
            }
        }
    }
}
