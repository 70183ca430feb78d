//! Recipe model
//!
//! A recipe declares what to build: the source, the dependencies, the
//! ordered build steps, and one or more output packages. The recipe
//! itself doubles as the main package; `[[packages]]` tables add
//! sub-packages that claim parts of the build output by glob.

pub mod lint;
pub mod load;

use crate::source::SourceSpec;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Target-system variables available to recipes as `${var}`
#[derive(Debug, Clone)]
pub struct BuildVariables {
    pub distribution: String,
    pub distribution_version: String,
    pub codename: String,
    pub flavour: String,
    pub architecture: String,
}

impl BuildVariables {
    /// Identity substitution: every variable expands to its own
    /// `${...}` token. Used when linting without a target system.
    pub fn placeholder() -> Self {
        Self {
            distribution: "${distribution}".to_string(),
            distribution_version: "${distribution_version}".to_string(),
            codename: "${codename}".to_string(),
            flavour: "${flavour}".to_string(),
            architecture: "${architecture}".to_string(),
        }
    }

    pub fn expand(&self, input: &str) -> String {
        input
            .replace("${distribution}", &self.distribution)
            .replace("${distribution_version}", &self.distribution_version)
            .replace("${release}", &self.distribution_version)
            .replace("${codename}", &self.codename)
            .replace("${flavour}", &self.flavour)
            .replace("${architecture}", &self.architecture)
    }
}

/// One dependency entry: a bare version constraint, or a table with
/// install options
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    Version(String),
    Detailed {
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        install: Option<InstallSpec>,
    },
}

/// Install behavior of a dependency
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InstallSpec {
    /// `install = false` opts the package out of installation
    Enabled(bool),
    /// `install = "name=version"` substitutes what gets installed
    Replace(String),
}

impl DependencySpec {
    /// The name handed to the installer; `None` when opted out.
    /// OR-alternatives (`a|b`) simplify to the first alternative.
    pub fn install_name(&self, declared: &str) -> Option<String> {
        match self {
            Self::Version(_) => Some(first_alternative(declared)),
            Self::Detailed {
                install: Some(InstallSpec::Enabled(false)),
                ..
            } => None,
            Self::Detailed {
                install: Some(InstallSpec::Replace(name)),
                ..
            } => Some(name.trim().to_string()),
            Self::Detailed { .. } => Some(first_alternative(declared)),
        }
    }

    /// Declared version constraint, for package metadata
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::Version(v) if v != "*" => Some(v),
            Self::Detailed {
                version: Some(v), ..
            } if v != "*" => Some(v),
            _ => None,
        }
    }
}

fn first_alternative(name: &str) -> String {
    name.split('|').next().unwrap_or(name).trim().to_string()
}

/// One named build step
#[derive(Debug, Clone, Deserialize)]
pub struct BuildStep {
    pub name: String,
    pub run: String,
}

/// A sub-package claiming part of the build output
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PackageRecipe {
    pub name: String,
    pub version: Option<String>,
    pub iteration: Option<String>,
    pub depends: BTreeMap<String, DependencySpec>,
    pub conflicts: Vec<String>,
    pub provides: Vec<String>,
    pub replaces: Vec<String>,
    /// Globs over in-container paths this package claims
    pub files: Vec<String>,
    pub config_files: Vec<String>,
    /// Maintainer scripts by phase
    pub scripts: BTreeMap<String, String>,
    /// Shell commands run in the staged tree after extraction
    pub output_hooks: Vec<String>,
}

fn default_iteration() -> String {
    "1".to_string()
}

/// The full build description
#[derive(Debug, Clone, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub version: String,
    #[serde(default = "default_iteration")]
    pub iteration: String,
    #[serde(default)]
    pub maintainer: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub source: SourceSpec,
    /// Runtime dependencies of the main package
    #[serde(default)]
    pub depends: BTreeMap<String, DependencySpec>,
    /// Packages needed only to build
    #[serde(default)]
    pub build_depends: BTreeMap<String, DependencySpec>,
    /// Steps run in the build image before dependency installation
    #[serde(default)]
    pub before_dependencies: Vec<String>,
    /// Steps run after dependency installation, before the build
    #[serde(default)]
    pub before_build: Vec<String>,
    /// The build itself, in declaration order
    #[serde(default)]
    pub steps: Vec<BuildStep>,
    /// Files copied into the build image alongside the build script
    #[serde(default)]
    pub mount_files: Vec<String>,
    // main-package fields
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub replaces: Vec<String>,
    #[serde(default)]
    pub config_files: Vec<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub output_hooks: Vec<String>,
    /// Sub-packages
    #[serde(default)]
    pub packages: Vec<PackageRecipe>,
}

impl Recipe {
    /// The main package implied by the recipe's own fields
    fn main_package(&self) -> PackageRecipe {
        PackageRecipe {
            name: self.name.clone(),
            version: Some(self.version.clone()),
            iteration: Some(self.iteration.clone()),
            depends: self.depends.clone(),
            conflicts: self.conflicts.clone(),
            provides: self.provides.clone(),
            replaces: self.replaces.clone(),
            files: Vec::new(),
            config_files: self.config_files.clone(),
            scripts: self.scripts.clone(),
            output_hooks: self.output_hooks.clone(),
        }
    }

    /// Every output package with version/iteration resolved; the main
    /// package comes first.
    pub fn output_packages(&self) -> Vec<PackageRecipe> {
        let mut packages = vec![self.main_package()];
        for sub in &self.packages {
            let mut sub = sub.clone();
            sub.version.get_or_insert_with(|| self.version.clone());
            sub.iteration.get_or_insert_with(|| self.iteration.clone());
            packages.push(sub);
        }
        packages
    }

    /// Substitute `${var}` build variables into step and script text
    pub fn apply_variables(&mut self, vars: &BuildVariables) {
        for step in &mut self.steps {
            step.run = vars.expand(&step.run);
        }
        for cmd in self
            .before_dependencies
            .iter_mut()
            .chain(self.before_build.iter_mut())
        {
            *cmd = vars.expand(cmd);
        }
        for script in self.scripts.values_mut() {
            *script = vars.expand(script);
        }
        for hook in &mut self.output_hooks {
            *hook = vars.expand(hook);
        }
        for package in &mut self.packages {
            for script in package.scripts.values_mut() {
                *script = vars.expand(script);
            }
            for hook in &mut package.output_hooks {
                *hook = vars.expand(hook);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BuildVariables {
        BuildVariables {
            distribution: "ubuntu".to_string(),
            distribution_version: "24.04".to_string(),
            codename: "noble".to_string(),
            flavour: "debian".to_string(),
            architecture: "amd64".to_string(),
        }
    }

    #[test]
    fn variables_expand() {
        let expanded = vars().expand("deb ${distribution}-${release} (${codename})");
        assert_eq!(expanded, "deb ubuntu-24.04 (noble)");
    }

    #[test]
    fn install_name_follows_options() {
        let bare = DependencySpec::Version("*".to_string());
        assert_eq!(bare.install_name("gcc"), Some("gcc".to_string()));

        let alternatives = DependencySpec::Version(">= 1".to_string());
        assert_eq!(
            alternatives.install_name("libssl-dev|libssl1.0-dev"),
            Some("libssl-dev".to_string())
        );

        let opted_out = DependencySpec::Detailed {
            version: None,
            install: Some(InstallSpec::Enabled(false)),
        };
        assert_eq!(opted_out.install_name("ruby"), None);

        let substituted = DependencySpec::Detailed {
            version: None,
            install: Some(InstallSpec::Replace("ruby2.1=2.1.5".to_string())),
        };
        assert_eq!(
            substituted.install_name("ruby"),
            Some("ruby2.1=2.1.5".to_string())
        );
    }

    #[test]
    fn version_constraint_surfaces_for_metadata() {
        let spec = DependencySpec::Version(">= 2.0".to_string());
        assert_eq!(spec.version(), Some(">= 2.0"));
        let any = DependencySpec::Version("*".to_string());
        assert_eq!(any.version(), None);
    }

    #[test]
    fn output_packages_resolve_versions() {
        let mut recipe: Recipe = toml::from_str(
            r#"
            name = "tool"
            version = "1.2.3"

            [[packages]]
            name = "tool-doc"
            files = ["/usr/share/doc/**"]
            "#,
        )
        .unwrap();
        recipe.iteration = "2".to_string();

        let packages = recipe.output_packages();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "tool");
        assert_eq!(packages[1].name, "tool-doc");
        assert_eq!(packages[1].version.as_deref(), Some("1.2.3"));
        assert_eq!(packages[1].iteration.as_deref(), Some("2"));
    }
}
