//! Building environments straight out of a bundle, plus robot-tree
//! extraction.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use holotree::{
    build::{EnvironmentBuilder, ToolchainDriver},
    library::Library,
    space::SpaceManager,
    CancelToken, HolotreeContext, Scorecard,
};
use holotree_types::{Recipe, RecipeFile};
use serde::Serialize;

use crate::{
    import::import_bundle,
    reader::{safe_destination, Bundle},
    BundleError,
};

/// One recipe found under `envs/` in a bundle.
#[derive(Debug, Clone)]
pub struct BundledEnvironment {
    /// The environment name (the directory under `envs/`).
    pub name: String,
    /// The raw `conda.yaml` payload.
    pub recipe: Vec<u8>,
}

/// The per-environment result of a build-from-bundle run.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentResult {
    /// The environment name.
    pub name: String,
    /// The blueprint hash, when composition succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Whether build (and restore, when requested) succeeded.
    pub success: bool,
    /// The restored space path, when one was materialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// The failure, when there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lists the environments declared in a bundle (`envs/<name>/conda.yaml`).
pub fn environments(bundle: &mut Bundle) -> Result<Vec<BundledEnvironment>, BundleError> {
    let mut found = Vec::new();
    for name in bundle.entry_names() {
        let parts: Vec<&str> = name.split('/').collect();
        if let ["envs", env_name, "conda.yaml"] = parts.as_slice() {
            found.push(BundledEnvironment {
                name: (*env_name).to_owned(),
                recipe: bundle.read_entry(&name)?,
            });
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// Extracts the `robot/` tree of a bundle into `dest`. Every entry name is
/// validated before anything is written: a single traversal attempt rejects
/// the whole extraction with no file on disk.
pub fn extract_robot_tree(bundle: &mut Bundle, dest: &Path) -> Result<usize, BundleError> {
    let mut planned = Vec::new();
    for name in bundle.entry_names() {
        let Some(relative) = name.strip_prefix("robot/") else {
            continue;
        };
        if relative.is_empty() || relative.ends_with('/') {
            continue;
        }
        let destination = safe_destination(dest, relative)?;
        planned.push((name, destination));
    }

    for (name, destination) in &planned {
        if let Some(parent) = destination.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let bytes = bundle.read_entry(name)?;
        fs_err::write(destination, bytes)?;
    }
    Ok(planned.len())
}

/// Imports a bundle's embedded library (when present), then composes and
/// builds every environment it declares. With `restore_spaces` each built
/// environment is also projected into a space named after it.
///
/// Individual environment failures are reported per entry, not
/// short-circuited; callers decide how to surface partial failure.
#[allow(clippy::too_many_arguments)]
pub fn build_from_bundle(
    bundle_path: &Path,
    context: Arc<HolotreeContext>,
    library: &Library,
    driver: Arc<dyn ToolchainDriver>,
    controller: &str,
    restore_spaces: bool,
    scorecard: &Scorecard,
    cancel: &CancelToken,
) -> Result<Vec<EnvironmentResult>, BundleError> {
    let mut bundle = crate::reader::open_bundle(bundle_path)?;

    if let Some(disk) = library.as_disk() {
        import_bundle(disk, &mut bundle, cancel)?;
    }

    let environments = environments(&mut bundle)?;
    let builder = EnvironmentBuilder::new(context.clone(), library, driver);
    let spaces = SpaceManager::new(context.clone());

    let mut results = Vec::with_capacity(environments.len());
    for env in environments {
        cancel.check()?;
        results.push(build_one(
            &builder, &spaces, library, env, controller, restore_spaces, scorecard, cancel,
        ));
    }
    Ok(results)
}

#[allow(clippy::too_many_arguments)]
fn build_one(
    builder: &EnvironmentBuilder<'_>,
    spaces: &SpaceManager,
    library: &Library,
    env: BundledEnvironment,
    controller: &str,
    restore_spaces: bool,
    scorecard: &Scorecard,
    cancel: &CancelToken,
) -> EnvironmentResult {
    let mut result = EnvironmentResult {
        name: env.name.clone(),
        hash: None,
        success: false,
        path: None,
        error: None,
    };

    let recipe = match parse_recipe(&env) {
        Ok(recipe) => recipe,
        Err(err) => {
            result.error = Some(err.to_string());
            return result;
        }
    };

    let outcome = match builder.build(&[recipe], scorecard, cancel) {
        Ok(outcome) => outcome,
        Err(err) => {
            result.error = Some(err.to_string());
            return result;
        }
    };
    result.hash = Some(outcome.hash.to_string());

    if restore_spaces {
        let Some(disk) = library.as_disk() else {
            result.error = Some("cannot restore spaces from a null library".to_owned());
            return result;
        };
        match spaces.restore(disk, &outcome.hash, controller, &env.name, scorecard, cancel) {
            Ok(path) => result.path = Some(path),
            Err(err) => {
                result.error = Some(err.to_string());
                return result;
            }
        }
    }

    result.success = true;
    result
}

fn parse_recipe(env: &BundledEnvironment) -> Result<RecipeFile, BundleError> {
    let text = std::str::from_utf8(&env.recipe).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    })?;
    let path = PathBuf::from(format!("envs/{}/conda.yaml", env.name));
    let recipe = Recipe::from_yaml_str(text).map_err(|e| {
        holotree_types::RecipeError::InvalidRecipe {
            file: path.clone(),
            line: e.location().map(|l| l.line()).unwrap_or(0),
            message: e.to_string(),
        }
    })?;
    Ok(RecipeFile { path, recipe })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use zip::write::SimpleFileOptions;

    use super::{environments, extract_robot_tree};
    use crate::{reader::open_bundle, BundleError};

    fn robot_bundle(path: &std::path::Path, evil_entry: Option<&str>) {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("envs/demo/conda.yaml", SimpleFileOptions::default())
            .unwrap();
        writer
            .write_all(b"channels: [conda-forge]\ndependencies:\n  - python=3.10\n")
            .unwrap();
        writer
            .start_file("robot/tasks/main.py", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"print('run')\n").unwrap();
        writer
            .start_file("robot/robot.yaml", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"tasks: {}\n").unwrap();
        if let Some(evil) = evil_entry {
            writer
                .start_file(evil, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"pwned").unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn environments_are_discovered_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("robot.zip");
        robot_bundle(&path, None);
        let mut bundle = open_bundle(&path).unwrap();
        let envs = environments(&mut bundle).unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].name, "demo");
        assert!(envs[0].recipe.starts_with(b"channels:"));
    }

    #[test]
    fn robot_tree_extracts_without_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("robot.zip");
        robot_bundle(&path, None);
        let dest = dir.path().join("project");
        std::fs::create_dir_all(&dest).unwrap();

        let mut bundle = open_bundle(&path).unwrap();
        let written = extract_robot_tree(&mut bundle, &dest).unwrap();
        assert_eq!(written, 2);
        assert!(dest.join("tasks/main.py").is_file());
        assert!(dest.join("robot.yaml").is_file());
    }

    #[test]
    fn traversal_entry_rejects_whole_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evil.zip");
        robot_bundle(&path, Some("robot/../../etc/passwd"));
        let dest = dir.path().join("project");
        std::fs::create_dir_all(&dest).unwrap();

        let mut bundle = open_bundle(&path).unwrap();
        let err = extract_robot_tree(&mut bundle, &dest).unwrap_err();
        assert_matches!(err, BundleError::PathTraversal(_));
        // Nothing was written, not even the benign entries.
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    }
}
