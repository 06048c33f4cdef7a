//! The environment builder: drives the external toolchain and records the
//! result as a catalog.
//!
//! The toolchain itself is a black box behind [`ToolchainDriver`]; the
//! builder only cares about exit status and the artifact layout left in the
//! staging directory. A failed build removes the staging directory and
//! leaves the library untouched.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use holotree_lock::{acquire, LockError, LockMode};
use holotree_types::{Blueprint, BlueprintHash, RecipeError, RecipeFile};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{
    cancel::{CancelToken, Cancelled},
    catalog::Catalog,
    context::HolotreeContext,
    library::{Library, LibraryError, RecordMeta},
    scorecard::{Scorecard, ScorecardPhase, StepStatus},
};

/// The stage a build failure happened in.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BuildStage {
    /// Staging directory preparation.
    Prepare,
    /// Conda/pip provisioning by the toolchain.
    Provision,
    /// Post-install scripts.
    PostInstall,
    /// Environment capture.
    Capture,
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStage::Prepare => write!(f, "prepare"),
            BuildStage::Provision => write!(f, "provision"),
            BuildStage::PostInstall => write!(f, "post-install"),
            BuildStage::Capture => write!(f, "capture"),
        }
    }
}

/// A toolchain invocation that did not succeed; `details` carries the tail
/// of captured stderr.
#[derive(Debug, thiserror::Error)]
#[error("{details}")]
pub struct ToolchainError {
    /// Why the invocation failed, including the stderr tail.
    pub details: String,
}

/// Errors raised by the builder.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Recipe parsing or blueprint composition failed.
    #[error(transparent)]
    Recipe(#[from] RecipeError),

    /// The library refused an operation.
    #[error(transparent)]
    Library(#[from] LibraryError),

    /// A lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The external toolchain failed.
    #[error("build failed during {stage}")]
    BuildFailed {
        /// The stage that failed.
        stage: BuildStage,
        /// The underlying failure with stderr tail.
        #[source]
        source: ToolchainError,
    },

    /// Staging directory trouble.
    #[error("build staging i/o failure")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// The seam to the external toolchain. The real implementation shells out;
/// tests script it.
pub trait ToolchainDriver: Send + Sync {
    /// Versions of the tools, stamped into the catalog.
    fn tool_versions(&self) -> IndexMap<String, String>;

    /// Materializes the conda and pip layers of `blueprint` into `staging`.
    fn provision(&self, blueprint: &Blueprint, staging: &Path) -> Result<(), ToolchainError>;

    /// Runs one post-install command inside `staging`.
    fn post_install(&self, command: &str, staging: &Path) -> Result<(), ToolchainError>;

    /// Captures the shell variables a space should export on activation.
    /// Values use `{{key}}` placeholders so they stay valid for any space
    /// the catalog is later restored into.
    fn capture_environment(&self, staging: &Path)
        -> Result<IndexMap<String, String>, ToolchainError>;
}

/// The result of one build request.
#[derive(Debug)]
pub struct BuildOutcome {
    /// The catalog for the blueprint.
    pub catalog: Catalog,
    /// The blueprint hash.
    pub hash: BlueprintHash,
    /// False when an existing catalog was reused without driving the
    /// toolchain.
    pub rebuilt: bool,
}

/// Per-process serialization of builds for the same blueprint: the
/// cross-process lock is reentrant within a process, so two threads racing
/// on one blueprint coalesce here and the loser reuses the winner's catalog.
static INFLIGHT_BUILDS: Lazy<Mutex<HashMap<BlueprintHash, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Builds environments by driving a toolchain and recording the result.
pub struct EnvironmentBuilder<'a> {
    context: Arc<HolotreeContext>,
    library: &'a Library,
    driver: Arc<dyn ToolchainDriver>,
}

impl<'a> EnvironmentBuilder<'a> {
    /// A builder recording into `library` through `driver`.
    pub fn new(
        context: Arc<HolotreeContext>,
        library: &'a Library,
        driver: Arc<dyn ToolchainDriver>,
    ) -> Self {
        EnvironmentBuilder {
            context,
            library,
            driver,
        }
    }

    /// Composes `recipes` and ensures a catalog for the result exists,
    /// building it if necessary.
    pub fn build(
        &self,
        recipes: &[RecipeFile],
        scorecard: &Scorecard,
        cancel: &CancelToken,
    ) -> Result<BuildOutcome, BuildError> {
        let blueprint =
            Blueprint::compose(recipes, self.context.options().dev_dependencies)?;
        self.build_blueprint(&blueprint, scorecard, cancel)
    }

    /// Ensures a catalog for `blueprint` exists. The toolchain runs at most
    /// once per blueprint, no matter how many threads or processes ask.
    pub fn build_blueprint(
        &self,
        blueprint: &Blueprint,
        scorecard: &Scorecard,
        cancel: &CancelToken,
    ) -> Result<BuildOutcome, BuildError> {
        cancel.check()?;
        let hash = blueprint.hash();
        let force = self.context.options().force_build;

        if !force && self.library.has_blueprint(&hash) {
            tracing::debug!("blueprint {hash} already in the library, skipping build");
            return Ok(BuildOutcome {
                catalog: self.library.load_catalog(&hash)?,
                hash,
                rebuilt: false,
            });
        }

        // Serialize same-blueprint builds within this process.
        let gate = INFLIGHT_BUILDS
            .lock()
            .entry(hash.clone())
            .or_default()
            .clone();
        let _inflight = gate.lock();

        if !force && self.library.has_blueprint(&hash) {
            return Ok(BuildOutcome {
                catalog: self.library.load_catalog(&hash)?,
                hash,
                rebuilt: false,
            });
        }

        // Serialize against other processes, then check a third time: the
        // winner of the cross-process race has already recorded.
        let _blueprint_lock = acquire(
            &self.context.blueprint_lock(&hash),
            LockMode::Exclusive,
            self.context.options().lock_timeout,
        )?;
        if !force && self.library.has_blueprint(&hash) {
            return Ok(BuildOutcome {
                catalog: self.library.load_catalog(&hash)?,
                hash,
                rebuilt: false,
            });
        }

        let catalog = self.drive_toolchain(blueprint, scorecard, cancel)?;
        Ok(BuildOutcome {
            catalog,
            hash,
            rebuilt: true,
        })
    }

    fn drive_toolchain(
        &self,
        blueprint: &Blueprint,
        scorecard: &Scorecard,
        cancel: &CancelToken,
    ) -> Result<Catalog, BuildError> {
        cancel.check()?;
        scorecard.post(
            ScorecardPhase::Prepare,
            0,
            StepStatus::Started,
            "preparing staging directory",
        );
        fs_err::create_dir_all(self.context.tmp_dir())?;
        // Dropped on any failure path, removing the partial build.
        let staging = tempfile::Builder::new()
            .prefix("staging-")
            .tempdir_in(self.context.tmp_dir())?;
        scorecard.post(
            ScorecardPhase::Prepare,
            0,
            StepStatus::Completed,
            staging.path().display().to_string(),
        );

        cancel.check()?;
        scorecard.post(
            ScorecardPhase::Provision,
            0,
            StepStatus::Started,
            "provisioning environment",
        );
        self.driver
            .provision(blueprint, staging.path())
            .map_err(|source| {
                scorecard.post(
                    ScorecardPhase::Provision,
                    0,
                    StepStatus::Failed,
                    source.details.clone(),
                );
                BuildError::BuildFailed {
                    stage: BuildStage::Provision,
                    source,
                }
            })?;
        scorecard.post(
            ScorecardPhase::Provision,
            0,
            StepStatus::Completed,
            "environment provisioned",
        );

        for (index, command) in blueprint.post_install.iter().enumerate() {
            cancel.check()?;
            scorecard.post(
                ScorecardPhase::PostInstall,
                index,
                StepStatus::Started,
                command.clone(),
            );
            self.driver
                .post_install(command, staging.path())
                .map_err(|source| {
                    scorecard.post(
                        ScorecardPhase::PostInstall,
                        index,
                        StepStatus::Failed,
                        source.details.clone(),
                    );
                    BuildError::BuildFailed {
                        stage: BuildStage::PostInstall,
                        source,
                    }
                })?;
            scorecard.post(
                ScorecardPhase::PostInstall,
                index,
                StepStatus::Completed,
                command.clone(),
            );
        }

        cancel.check()?;
        let environment = self
            .driver
            .capture_environment(staging.path())
            .map_err(|source| BuildError::BuildFailed {
                stage: BuildStage::Capture,
                source,
            })?;
        let meta = RecordMeta {
            tool_versions: self.driver.tool_versions(),
            environment,
        };

        Ok(self
            .library
            .record(blueprint, staging.path(), meta, scorecard, cancel)?)
    }
}

/// The real toolchain driver: shells out to micromamba and the provisioned
/// pip. Only exit status and the staging layout are consumed.
pub struct ProcessDriver {
    micromamba: PathBuf,
}

impl ProcessDriver {
    /// A driver using the given micromamba executable.
    pub fn new(micromamba: impl Into<PathBuf>) -> Self {
        ProcessDriver {
            micromamba: micromamba.into(),
        }
    }

    fn run(mut command: Command, what: &str) -> Result<std::process::Output, ToolchainError> {
        tracing::debug!("running {what}: {command:?}");
        let output = command.output().map_err(|err| ToolchainError {
            details: format!("failed to spawn {what}: {err}"),
        })?;
        if output.status.success() {
            return Ok(output);
        }
        Err(ToolchainError {
            details: format!(
                "{what} exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr, 10)
            ),
        })
    }

    fn staging_python(staging: &Path) -> PathBuf {
        if cfg!(windows) {
            staging.join("Scripts").join("python.exe")
        } else {
            staging.join("bin").join("python")
        }
    }
}

/// The last `lines` lines of captured stderr.
fn stderr_tail(stderr: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

impl ToolchainDriver for ProcessDriver {
    fn tool_versions(&self) -> IndexMap<String, String> {
        let mut versions = IndexMap::new();
        let mut command = Command::new(&self.micromamba);
        command.arg("--version");
        if let Ok(output) = Self::run(command, "micromamba --version") {
            versions.insert(
                "micromamba".to_owned(),
                String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            );
        }
        versions
    }

    fn provision(&self, blueprint: &Blueprint, staging: &Path) -> Result<(), ToolchainError> {
        // Hand the toolchain the effective recipe as a single conda.yaml.
        let recipe_path = staging.with_extension("conda.yaml");
        fs_err::write(&recipe_path, blueprint.to_recipe().to_yaml_string()).map_err(|err| {
            ToolchainError {
                details: format!("failed to write effective recipe: {err}"),
            }
        })?;

        let mut command = Command::new(&self.micromamba);
        command
            .arg("create")
            .arg("--yes")
            .arg("--prefix")
            .arg(staging)
            .arg("--file")
            .arg(&recipe_path);
        let result = Self::run(command, "micromamba create");
        let _ = fs_err::remove_file(&recipe_path);
        result?;

        if !blueprint.pip.is_empty() {
            let mut command = Command::new(Self::staging_python(staging));
            command.args(["-m", "pip", "install", "--no-input"]);
            command.args(&blueprint.pip);
            Self::run(command, "pip install")?;
        }
        Ok(())
    }

    fn post_install(&self, command_line: &str, staging: &Path) -> Result<(), ToolchainError> {
        let words = shlex::split(command_line).ok_or_else(|| ToolchainError {
            details: format!("unparseable post-install command: '{command_line}'"),
        })?;
        let Some((program, args)) = words.split_first() else {
            return Ok(());
        };
        let mut command = Command::new(program);
        command.args(args).current_dir(staging);
        Self::run(command, command_line).map(|_| ())
    }

    fn capture_environment(
        &self,
        _staging: &Path,
    ) -> Result<IndexMap<String, String>, ToolchainError> {
        let mut environment = IndexMap::new();
        let bin = if cfg!(windows) { "Scripts" } else { "bin" };
        environment.insert(
            "PATH".to_owned(),
            format!("{{{{holotreeSpace}}}}/{bin}"),
        );
        environment.insert("CONDA_PREFIX".to_owned(), "{{holotreeSpace}}".to_owned());
        environment.insert("PYTHON_EXE".to_owned(), "{{pythonExe}}".to_owned());
        Ok(environment)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use assert_matches::assert_matches;
    use holotree_types::Blueprint;
    use indexmap::IndexMap;

    use super::{
        BuildError, BuildStage, EnvironmentBuilder, ToolchainDriver, ToolchainError,
    };
    use crate::{
        context::{HolotreeContext, HolotreeOptions},
        library::Library,
        CancelToken, Scorecard,
    };

    /// A scripted toolchain: writes a small tree and counts invocations.
    struct ScriptedDriver {
        provisions: AtomicUsize,
        fail_provision: bool,
    }

    impl ScriptedDriver {
        fn new() -> Self {
            ScriptedDriver {
                provisions: AtomicUsize::new(0),
                fail_provision: false,
            }
        }

        fn failing() -> Self {
            ScriptedDriver {
                provisions: AtomicUsize::new(0),
                fail_provision: true,
            }
        }
    }

    impl ToolchainDriver for ScriptedDriver {
        fn tool_versions(&self) -> IndexMap<String, String> {
            IndexMap::from([(String::from("scripted"), String::from("1.0"))])
        }

        fn provision(
            &self,
            _blueprint: &Blueprint,
            staging: &Path,
        ) -> Result<(), ToolchainError> {
            self.provisions.fetch_add(1, Ordering::SeqCst);
            if self.fail_provision {
                return Err(ToolchainError {
                    details: "solver could not be satisfied\nlast stderr line".to_owned(),
                });
            }
            std::fs::create_dir_all(staging.join("bin")).unwrap();
            for index in 0..8 {
                std::fs::write(
                    staging.join("bin").join(format!("tool-{index}")),
                    format!("tool {index}"),
                )
                .unwrap();
            }
            Ok(())
        }

        fn post_install(&self, _command: &str, _staging: &Path) -> Result<(), ToolchainError> {
            Ok(())
        }

        fn capture_environment(
            &self,
            _staging: &Path,
        ) -> Result<IndexMap<String, String>, ToolchainError> {
            Ok(IndexMap::from([(
                String::from("CONDA_PREFIX"),
                String::from("{{holotreeSpace}}"),
            )]))
        }
    }

    fn test_context() -> (tempfile::TempDir, Arc<HolotreeContext>) {
        let home = tempfile::tempdir().unwrap();
        let context = Arc::new(HolotreeContext::new(home.path(), HolotreeOptions::default()));
        (home, context)
    }

    fn unique_blueprint(tag: &str) -> Blueprint {
        Blueprint {
            channels: vec!["conda-forge".to_owned()],
            conda: vec![format!("python={tag}")],
            pip: Vec::new(),
            pre_run: Vec::new(),
            post_install: Vec::new(),
            dev_dependencies: false,
        }
    }

    #[test]
    fn build_records_a_catalog() {
        let (_home, context) = test_context();
        let library = Library::disk(context.clone()).unwrap();
        let driver = Arc::new(ScriptedDriver::new());
        let builder = EnvironmentBuilder::new(context, &library, driver.clone());

        let blueprint = unique_blueprint("3.11.1");
        let outcome = builder
            .build_blueprint(&blueprint, &Scorecard::disabled(), &CancelToken::new())
            .unwrap();
        assert!(outcome.rebuilt);
        assert_eq!(driver.provisions.load(Ordering::SeqCst), 1);
        assert!(library.has_blueprint(&outcome.hash));
        assert_eq!(
            outcome.catalog.environment.get("CONDA_PREFIX").unwrap(),
            "{{holotreeSpace}}"
        );
        assert_eq!(outcome.catalog.tool_versions["scripted"], "1.0");
    }

    #[test]
    fn second_build_skips_the_toolchain() {
        let (_home, context) = test_context();
        let library = Library::disk(context.clone()).unwrap();
        let driver = Arc::new(ScriptedDriver::new());
        let builder = EnvironmentBuilder::new(context, &library, driver.clone());

        let blueprint = unique_blueprint("3.11.2");
        let first = builder
            .build_blueprint(&blueprint, &Scorecard::disabled(), &CancelToken::new())
            .unwrap();
        let second = builder
            .build_blueprint(&blueprint, &Scorecard::disabled(), &CancelToken::new())
            .unwrap();
        assert!(first.rebuilt);
        assert!(!second.rebuilt);
        assert_eq!(driver.provisions.load(Ordering::SeqCst), 1);
        assert_eq!(first.catalog, second.catalog);
    }

    #[test]
    fn concurrent_builds_drive_the_toolchain_once() {
        let (_home, context) = test_context();
        let library = Arc::new(Library::disk(context.clone()).unwrap());
        let driver = Arc::new(ScriptedDriver::new());
        let blueprint = unique_blueprint("3.11.3");

        std::thread::scope(|scope| {
            for _ in 0..2 {
                let context = context.clone();
                let library = Arc::clone(&library);
                let driver = Arc::clone(&driver);
                let blueprint = blueprint.clone();
                scope.spawn(move || {
                    let builder = EnvironmentBuilder::new(context, library.as_ref(), driver);
                    builder
                        .build_blueprint(
                            &blueprint,
                            &Scorecard::disabled(),
                            &CancelToken::new(),
                        )
                        .unwrap();
                });
            }
        });

        assert_eq!(driver.provisions.load(Ordering::SeqCst), 1);
        assert!(library.has_blueprint(&blueprint.hash()));
    }

    #[test]
    fn failed_provision_leaves_library_untouched() {
        let (_home, context) = test_context();
        let library = Library::disk(context.clone()).unwrap();
        let driver = Arc::new(ScriptedDriver::failing());
        let builder = EnvironmentBuilder::new(context.clone(), &library, driver);

        let blueprint = unique_blueprint("3.11.4");
        let err = builder
            .build_blueprint(&blueprint, &Scorecard::disabled(), &CancelToken::new())
            .unwrap_err();
        assert_matches!(
            err,
            BuildError::BuildFailed {
                stage: BuildStage::Provision,
                ..
            }
        );
        assert!(!library.has_blueprint(&blueprint.hash()));
        // The staging directory is gone.
        let staging_entries: Vec<_> = std::fs::read_dir(context.tmp_dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("staging-"))
            .collect();
        assert!(staging_entries.is_empty());
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let stderr = (0..20)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let tail = super::stderr_tail(stderr.as_bytes(), 3);
        assert_eq!(tail, "line 17\nline 18\nline 19");
    }
}
