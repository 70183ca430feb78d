//! The cook pipeline
//!
//! A linear state machine, fatal on any step's error: resolve the
//! recipe and target distribution, lint, materialize the source cache,
//! build (or reuse) the base image, build the build image, run it,
//! and extract the diff into per-package staging trees. Container
//! deletion is guaranteed on every exit path unless `--keep`.

use crate::cook::dockerfile::{self, BuildStage};
use crate::cook::flavour::{self, Distribution};
use crate::cook::output::{OutputPackage, PackageEmitter, StagingEmitter};
use crate::cook::splitter::{CopyInstruction, Splitter};
use crate::cook::UpdateMode;
use crate::docker::Docker;
use crate::error::{KilnError, KilnResult};
use crate::recipe::{lint, load, BuildVariables, Recipe};
use crate::source;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything one invocation of the pipeline needs
pub struct CookOptions {
    /// Starting image reference
    pub image: String,
    pub recipe_path: PathBuf,
    /// `--distribution` override (skips detection)
    pub distribution: Option<String>,
    /// Output format override (defaults by flavour)
    pub format: Option<String>,
    /// Keep the build container instead of deleting it
    pub keep: bool,
    /// Replace existing output artifacts
    pub overwrite: bool,
    pub update: UpdateMode,
    pub cache_dir: PathBuf,
    pub out_dir: PathBuf,
}

/// Deterministic tag for the dependency/base image: repeated builds
/// against an unchanged (image, source) pair reuse it
fn base_image_tag(image_id: &str, cachekey: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(cachekey.as_bytes());
    format!("kiln-base:{}", &hex::encode(hasher.finalize())[..32])
}

fn host_architecture() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner:.cyan} {msg}").unwrap());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message.to_string());
    pb
}

/// Run the whole pipeline
pub async fn cook(docker: &Docker, options: &CookOptions) -> KilnResult<()> {
    // locate the recipe before anything else
    if !options.recipe_path.is_file() {
        return Err(KilnError::RecipeNotFound(options.recipe_path.clone()));
    }

    let pb = create_progress_bar("Detecting distribution...");

    let distribution = match &options.distribution {
        Some(raw) => Distribution::parse_override(raw)?,
        None => flavour::detect(docker, &options.image).await?,
    };
    let target_flavour = distribution.flavour;
    let format = options
        .format
        .clone()
        .unwrap_or_else(|| target_flavour.package_format().to_string());
    debug!(
        "target: {} {} ({}, {format})",
        distribution.name,
        distribution.version,
        target_flavour.as_str()
    );

    let vars = BuildVariables {
        distribution: distribution.name.clone(),
        distribution_version: distribution.version.clone(),
        codename: distribution.codename.clone(),
        flavour: target_flavour.as_str().to_string(),
        architecture: host_architecture(),
    };

    // load + lint before any build activity
    pb.set_message("Linting recipe...");
    let recipe = load::load(&options.recipe_path, &vars)?;
    lint::lint(&recipe)?;

    // materialize the source and its cachekey
    pb.set_message("Preparing source...");
    let source_cache = source::build_cache(&recipe.source, &options.cache_dir)?;
    let cachekey = source_cache.cachekey()?;
    debug!("source cachekey: {cachekey}");

    let image_id = docker.image_id(&options.image).await?;
    let base_tag = base_image_tag(&image_id, &cachekey);
    pb.finish_and_clear();

    // base image: rebuilt only when no image carries the tag
    if docker.image_exists(&base_tag).await? {
        info!("base image cached: {base_tag}");
    } else {
        info!("building base image {base_tag}");
        let mut stage =
            dockerfile::source_stage(&options.image, source_cache.as_ref(), &recipe.source)?;
        let mut log = std::io::stdout();
        docker
            .build(&mut stage.context, "Dockerfile", Some(&base_tag), &mut log)
            .await?;
    }

    let refresh_index =
        flavour::index_refresh_needed(docker, &base_tag, target_flavour, options.update).await?;

    // build image: untagged, rebuilt every run
    info!("building build image");
    let mut stage = dockerfile::build_stage(&BuildStage {
        base_image: &base_tag,
        recipe: &recipe,
        flavour: target_flavour,
        refresh_index,
        mount_dir: options.recipe_path.parent().unwrap_or_else(|| Path::new(".")),
    })?;
    let build_image = {
        let mut log = std::io::stdout();
        docker
            .build(&mut stage.context, "Dockerfile", None, &mut log)
            .await?
    };

    // run the build, with guaranteed container cleanup
    let container = docker.create_container(&build_image).await?;
    info!(
        "running build in container {}",
        &container[..12.min(container.len())]
    );
    let result = run_and_extract(docker, &container, &recipe, options, &format).await;

    if options.keep {
        info!("keeping container {container}");
    } else if let Err(e) = docker.delete(&container).await {
        warn!("failed to delete container {container}: {e}");
    }
    result
}

async fn run_and_extract(
    docker: &Docker,
    container: &str,
    recipe: &Recipe,
    options: &CookOptions,
    format: &str,
) -> KilnResult<()> {
    docker.start(container).await?;

    {
        let mut stdout = std::io::stdout();
        let mut stderr = std::io::stderr();
        docker.attach(container, &mut stdout, &mut stderr).await?;
    }

    let code = docker.wait(container).await?;
    if code != 0 {
        return Err(KilnError::BuildFailed { code });
    }

    let changes = docker.changes(container).await?;
    debug!("{} diff entries", changes.len());

    let staging_root =
        tempfile::tempdir().map_err(|e| KilnError::io("creating staging root", e))?;
    let mut packages = Vec::new();
    for package_recipe in recipe.output_packages() {
        packages.push(OutputPackage::new(
            package_recipe,
            staging_root.path(),
            recipe.maintainer.clone(),
            recipe.vendor.clone(),
            format.to_string(),
        )?);
    }

    let matcher_input: Vec<_> = packages
        .iter()
        .map(|p| (p.recipe.clone(), p.staging.clone()))
        .collect();
    let splitter = Splitter::for_packages(&matcher_input)?;
    let instructions = splitter.split(&changes);
    info!("extracting {} changed files", instructions.len());

    for instruction in &instructions {
        extract_one(docker, container, instruction).await?;
        if let Some(package) = packages
            .iter_mut()
            .find(|p| p.staging == instruction.dest_root)
        {
            package.files.push(instruction.source.clone());
        }
    }

    let emitter = StagingEmitter {
        overwrite: options.overwrite,
    };
    for package in &packages {
        package.run_hooks()?;
        let artifact = emitter.write(package, &options.out_dir)?;
        println!("{} {}", style("✓").green(), artifact.display());
    }
    Ok(())
}

/// Pull one changed leaf out of the container into its staging slot
async fn extract_one(
    docker: &Docker,
    container: &str,
    instruction: &CopyInstruction,
) -> KilnResult<()> {
    let parent = instruction
        .dest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| instruction.dest_root.clone());
    std::fs::create_dir_all(&parent)
        .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;

    let file = docker.archive(container, &instruction.source).await?;
    tar::Archive::new(file)
        .unpack(&parent)
        .map_err(|e| KilnError::io(format!("unpacking {}", instruction.source), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_tag_is_deterministic_and_input_sensitive() {
        let a = base_image_tag("sha256:aaa", "key1");
        let b = base_image_tag("sha256:aaa", "key1");
        assert_eq!(a, b);
        assert!(a.starts_with("kiln-base:"));
        assert_eq!(a.len(), "kiln-base:".len() + 32);

        assert_ne!(a, base_image_tag("sha256:bbb", "key1"));
        assert_ne!(a, base_image_tag("sha256:aaa", "key2"));
    }

    #[test]
    fn architecture_maps_to_package_names() {
        let arch = host_architecture();
        assert!(!arch.is_empty());
        assert_ne!(arch, "x86_64");
    }
}
