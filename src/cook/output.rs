//! Output package staging and the emitter boundary
//!
//! The diff splitter fills per-package staging trees; output hooks run
//! against the staged files; a [`PackageEmitter`] turns the finished
//! staging tree plus metadata into the final artifact. The built-in
//! emitter finalizes the tree and a metadata document; the deb/rpm
//! serializers proper are external collaborators.

use crate::error::{KilnError, KilnResult};
use crate::recipe::PackageRecipe;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// A package being assembled from build output
pub struct OutputPackage {
    pub recipe: PackageRecipe,
    /// Staging tree the splitter copies into
    pub staging: PathBuf,
    /// In-container paths collected into this package
    pub files: Vec<String>,
    pub maintainer: Option<String>,
    pub vendor: Option<String>,
    /// Output format (deb/rpm), decided by flavour or override
    pub format: String,
}

impl OutputPackage {
    pub fn new(
        recipe: PackageRecipe,
        staging_root: &Path,
        maintainer: Option<String>,
        vendor: Option<String>,
        format: String,
    ) -> KilnResult<Self> {
        let staging = staging_root.join(&recipe.name);
        fs::create_dir_all(&staging)
            .map_err(|e| KilnError::io(format!("creating {}", staging.display()), e))?;
        Ok(Self {
            recipe,
            staging,
            files: Vec::new(),
            maintainer,
            vendor,
            format,
        })
    }

    /// Run the recipe's output hooks in the staged tree
    pub fn run_hooks(&self) -> KilnResult<()> {
        for hook in &self.recipe.output_hooks {
            debug!("output hook for {}: {hook}", self.recipe.name);
            let status = Command::new("/bin/sh")
                .arg("-c")
                .arg(hook)
                .current_dir(&self.staging)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(|e| KilnError::command_failed(hook.clone(), e))?;
            if !status.success() {
                return Err(KilnError::OutputHookFailed {
                    command: hook.clone(),
                    code: status.code().unwrap_or(-1),
                });
            }
        }
        Ok(())
    }

    fn artifact_stem(&self) -> String {
        format!(
            "{}-{}-{}",
            self.recipe.name,
            self.recipe.version.as_deref().unwrap_or("0"),
            self.recipe.iteration.as_deref().unwrap_or("1"),
        )
    }

    /// Serializable metadata for the external package serializer
    fn metadata(&self) -> serde_json::Value {
        let depends: serde_json::Map<String, serde_json::Value> = self
            .recipe
            .depends
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    serde_json::Value::String(spec.version().unwrap_or("*").to_string()),
                )
            })
            .collect();

        serde_json::json!({
            "name": self.recipe.name,
            "version": self.recipe.version,
            "iteration": self.recipe.iteration,
            "format": self.format,
            "maintainer": self.maintainer,
            "vendor": self.vendor,
            "depends": depends,
            "conflicts": self.recipe.conflicts,
            "provides": self.recipe.provides,
            "replaces": self.recipe.replaces,
            "config_files": self.recipe.config_files,
            "scripts": self.recipe.scripts,
            "files": self.files,
        })
    }
}

/// Turns a finished staging tree plus metadata into an artifact
pub trait PackageEmitter {
    fn write(&self, package: &OutputPackage, out_dir: &Path) -> KilnResult<PathBuf>;
}

/// Built-in emitter: staged tree at `<out>/<name>-<version>-<iteration>/`
/// with a metadata document beside it
pub struct StagingEmitter {
    pub overwrite: bool,
}

impl PackageEmitter for StagingEmitter {
    fn write(&self, package: &OutputPackage, out_dir: &Path) -> KilnResult<PathBuf> {
        let stem = package.artifact_stem();
        let dest = out_dir.join(&stem);
        let metadata_path = out_dir.join(format!("{stem}.{}.json", package.format));

        if dest.exists() {
            if !self.overwrite {
                return Err(KilnError::OutputExists(dest));
            }
            fs::remove_dir_all(&dest)
                .map_err(|e| KilnError::io(format!("clearing {}", dest.display()), e))?;
        }

        // the staging tree usually lives on another filesystem, so
        // copy rather than rename
        crate::source::dir::copy_tree(&package.staging, &dest, false)?;

        let metadata = serde_json::to_string_pretty(&package.metadata())?;
        fs::write(&metadata_path, metadata)
            .map_err(|e| KilnError::io(format!("writing {}", metadata_path.display()), e))?;

        info!("staged {} -> {}", package.recipe.name, dest.display());
        Ok(dest)
    }
}
