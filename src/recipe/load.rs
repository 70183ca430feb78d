//! Recipe loading
//!
//! Reads a declarative `recipe.toml` into a fully-resolved [`Recipe`]
//! value. Relative paths in the recipe (patches, local source
//! directories) resolve against the recipe's own directory, and build
//! variables are substituted before the recipe is handed out.

use crate::error::{KilnError, KilnResult};
use crate::recipe::{BuildVariables, Recipe};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Default recipe filename
pub const DEFAULT_RECIPE: &str = "recipe.toml";

/// Load a recipe file; a missing file is the distinguished
/// "recipe not found" error.
pub fn load(path: &Path, vars: &BuildVariables) -> KilnResult<Recipe> {
    if !path.is_file() {
        return Err(KilnError::RecipeNotFound(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)
        .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
    let mut recipe: Recipe = toml::from_str(&text).map_err(|e| KilnError::RecipeInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let recipe_dir = path.parent().unwrap_or_else(|| Path::new("."));
    anchor_paths(&mut recipe, recipe_dir);
    recipe.apply_variables(vars);
    debug!(
        "loaded recipe {} {} ({} steps, {} packages)",
        recipe.name,
        recipe.version,
        recipe.steps.len(),
        recipe.output_packages().len()
    );
    Ok(recipe)
}

/// Resolve recipe-relative paths against the recipe directory
fn anchor_paths(recipe: &mut Recipe, recipe_dir: &Path) {
    for patch in &mut recipe.source.patches {
        if patch.file.is_relative() {
            patch.file = recipe_dir.join(&patch.file);
        }
    }
    let url = &recipe.source.url;
    if url.starts_with("./") || url.starts_with("../") {
        recipe.source.url = recipe_dir.join(url).to_string_lossy().into_owned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn vars() -> BuildVariables {
        BuildVariables {
            distribution: "ubuntu".to_string(),
            distribution_version: "24.04".to_string(),
            codename: "noble".to_string(),
            flavour: "debian".to_string(),
            architecture: "amd64".to_string(),
        }
    }

    const RECIPE: &str = r#"
name = "hello"
version = "2.12"

[source]
url = "https://example.com/hello-2.12.tar.gz"
checksum = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
patches = [{ file = "fix-build.patch" }]

[build_depends]
gcc = "*"

[[steps]]
name = "configure"
run = "./configure --prefix=/usr"

[[steps]]
name = "install"
run = "make install DESTDIR=/ DIST=${distribution}"
"#;

    #[test]
    fn missing_recipe_is_distinguished() {
        let err = load(Path::new("/no/such/recipe.toml"), &vars()).unwrap_err();
        match err {
            KilnError::RecipeNotFound(path) => {
                assert_eq!(path, PathBuf::from("/no/such/recipe.toml"));
            }
            other => panic!("expected RecipeNotFound, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recipe.toml");
        fs::write(&path, "name = [broken").unwrap();
        let err = load(&path, &vars()).unwrap_err();
        assert!(matches!(err, KilnError::RecipeInvalid { .. }));
    }

    #[test]
    fn loads_and_expands_variables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recipe.toml");
        fs::write(&path, RECIPE).unwrap();

        let recipe = load(&path, &vars()).unwrap();
        assert_eq!(recipe.name, "hello");
        assert_eq!(recipe.iteration, "1");
        assert_eq!(recipe.steps[1].run, "make install DESTDIR=/ DIST=ubuntu");
    }

    #[test]
    fn patch_paths_anchor_to_recipe_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recipe.toml");
        fs::write(&path, RECIPE).unwrap();

        let recipe = load(&path, &vars()).unwrap();
        assert_eq!(
            recipe.source.patches[0].file,
            dir.path().join("fix-build.patch")
        );
    }

    #[test]
    fn relative_source_dir_anchors_to_recipe_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recipe.toml");
        fs::write(
            &path,
            "name = \"x\"\nversion = \"1\"\n\n[source]\nurl = \"./src\"\n",
        )
        .unwrap();

        let recipe = load(&path, &vars()).unwrap();
        assert_eq!(
            recipe.source.url,
            dir.path().join("./src").to_string_lossy()
        );
    }
}
