//! Lint command - check a recipe without building

use crate::cli::args::LintArgs;
use crate::error::KilnResult;
use crate::recipe::{lint, load, BuildVariables};
use console::style;

/// Execute the lint command
pub async fn execute(args: LintArgs) -> KilnResult<()> {
    let recipe = load::load(&args.recipe, &BuildVariables::placeholder())?;
    lint::lint(&recipe)?;
    println!(
        "{} {} {} lints clean ({} packages)",
        style("✓").green(),
        recipe.name,
        recipe.version,
        recipe.output_packages().len()
    );
    Ok(())
}
