//! Recipe lint
//!
//! Structural checks plus a syntax check of maintainer scripts against
//! their declared interpreter. Lint runs before any engine activity;
//! every problem is collected so one pass reports them all.

use crate::error::{KilnError, KilnResult};
use crate::recipe::Recipe;
use std::collections::BTreeSet;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

const SCRIPT_PHASES: &[&str] = &[
    "before_install",
    "after_install",
    "before_remove",
    "after_remove",
];

/// Interpreters whose `-n` flag performs a syntax-only check
const CHECKABLE_INTERPRETERS: &[&str] = &["sh", "bash", "dash", "ksh"];

/// Lint a recipe; any problem aborts the build before it starts
pub fn lint(recipe: &Recipe) -> KilnResult<()> {
    let mut problems = Vec::new();

    if recipe.name.trim().is_empty() {
        problems.push("recipe name is empty".to_string());
    }
    if recipe.version.trim().is_empty() {
        problems.push("recipe version is empty".to_string());
    }
    if recipe.steps.is_empty() {
        problems.push("recipe has no build steps".to_string());
    }
    for (index, step) in recipe.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            problems.push(format!("step {} has no name", index + 1));
        }
        if step.run.trim().is_empty() {
            problems.push(format!("step {:?} has no command", step.name));
        }
    }

    let mut seen = BTreeSet::new();
    for package in recipe.output_packages() {
        if package.name.trim().is_empty() {
            problems.push("package with empty name".to_string());
            continue;
        }
        if !seen.insert(package.name.clone()) {
            problems.push(format!("duplicate package name: {}", package.name));
        }
        for (phase, script) in &package.scripts {
            if !SCRIPT_PHASES.contains(&phase.as_str()) {
                problems.push(format!(
                    "package {}: unknown script phase {:?} (expected one of {})",
                    package.name,
                    phase,
                    SCRIPT_PHASES.join(", ")
                ));
                continue;
            }
            if let Some(problem) = check_script(&package.name, phase, script) {
                problems.push(problem);
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(KilnError::RecipeLint { problems })
    }
}

/// Syntax-check one maintainer script with its interpreter's `-n`
fn check_script(package: &str, phase: &str, script: &str) -> Option<String> {
    let interpreter = script
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("#!"))
        .map(|line| line.split_whitespace().next().unwrap_or("").to_string())
        .unwrap_or_else(|| "/bin/sh".to_string());

    let basename = interpreter.rsplit('/').next().unwrap_or(&interpreter);
    if !CHECKABLE_INTERPRETERS.contains(&basename) {
        debug!("skipping syntax check for {package} {phase}: interpreter {interpreter}");
        return None;
    }

    let mut file = match tempfile::NamedTempFile::new() {
        Ok(file) => file,
        Err(e) => return Some(format!("{package} {phase}: cannot stage script: {e}")),
    };
    if let Err(e) = file.write_all(script.as_bytes()) {
        return Some(format!("{package} {phase}: cannot stage script: {e}"));
    }

    let output = Command::new(&interpreter)
        .arg("-n")
        .arg(file.path())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();

    match output {
        Ok(output) if output.status.success() => None,
        Ok(output) => Some(format!(
            "{package} {phase} script fails {basename} -n: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(e) => Some(format!(
            "{package} {phase}: cannot run {interpreter}: {e}"
        )),
    }
}
