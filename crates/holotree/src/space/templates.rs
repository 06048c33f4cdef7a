//! Placeholder substitution for shell-activation files.
//!
//! Activation scripts are recorded with `{{key}}` placeholders instead of
//! absolute paths; restore substitutes the concrete values for the space
//! being materialized. The variable set is fixed: `holotreeSpace`,
//! `pythonExe`, `condaPrefix` and `platform`.

use std::path::Path;

use holotree_types::Platform;

/// The concrete values substituted into activation files of one space.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    /// Absolute path of the materialized space.
    pub holotree_space: String,
    /// Absolute path of the python interpreter inside the space.
    pub python_exe: String,
    /// Absolute path of the conda prefix (the space itself).
    pub conda_prefix: String,
    /// The platform tag.
    pub platform: String,
}

impl TemplateVars {
    /// The variables for a space rooted at `target` on `platform`.
    pub fn for_space(target: &Path, platform: Platform) -> Self {
        let python_exe = if platform.is_windows() {
            target.join("Scripts").join("python.exe")
        } else {
            target.join("bin").join("python")
        };
        TemplateVars {
            holotree_space: target.display().to_string(),
            python_exe: python_exe.display().to_string(),
            conda_prefix: target.display().to_string(),
            platform: platform.to_string(),
        }
    }

    fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            ("holotreeSpace", self.holotree_space.as_str()),
            ("pythonExe", self.python_exe.as_str()),
            ("condaPrefix", self.conda_prefix.as_str()),
            ("platform", self.platform.as_str()),
        ]
    }

    /// Substitutes every `{{key}}` placeholder in `content`.
    pub fn substitute(&self, content: &str) -> String {
        let mut out = content.to_owned();
        for (key, value) in self.pairs() {
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        out
    }
}

/// True for files that receive placeholder substitution on restore:
/// `activate*` scripts directly under `bin/` or `Scripts/`.
pub fn is_activation_file(relative: &Path) -> bool {
    let Some(parent) = relative.parent().and_then(|p| p.file_name()) else {
        return false;
    };
    if parent != "bin" && parent != "Scripts" {
        return false;
    }
    relative
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.to_ascii_lowercase().starts_with("activate"))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use holotree_types::Platform;
    use rstest::rstest;

    use super::{is_activation_file, TemplateVars};

    #[test]
    fn substitutes_the_fixed_variable_set() {
        let vars = TemplateVars::for_space(Path::new("/spaces/ab/cd"), Platform::Linux64);
        let script = "export CONDA_PREFIX={{condaPrefix}}\nexport HT={{holotreeSpace}}\npython={{pythonExe}} # {{platform}}\n";
        let rendered = vars.substitute(script);
        assert_eq!(
            rendered,
            "export CONDA_PREFIX=/spaces/ab/cd\nexport HT=/spaces/ab/cd\npython=/spaces/ab/cd/bin/python # linux_64\n"
        );
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let vars = TemplateVars::for_space(Path::new("/s"), Platform::Linux64);
        assert_eq!(vars.substitute("{{mystery}}"), "{{mystery}}");
    }

    #[rstest]
    #[case("bin/activate", true)]
    #[case("bin/activate.fish", true)]
    #[case("Scripts/Activate.ps1", true)]
    #[case("Scripts/activate.bat", true)]
    #[case("bin/python", false)]
    #[case("activate", false)]
    #[case("lib/bin/deactivate", false)]
    fn activation_file_detection(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_activation_file(Path::new(path)), expected);
    }
}
