//! CLI argument definitions using clap derive

use crate::cook::UpdateMode;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Kiln - Container Package Builder
///
/// Builds native OS packages by running a declarative recipe inside a
/// disposable container and harvesting only the files the build
/// produced.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build packages from a recipe inside a disposable container
    Cook(CookArgs),

    /// Check a recipe without building anything
    Lint(LintArgs),
}

/// Arguments for the cook command
#[derive(Parser, Debug)]
pub struct CookArgs {
    /// Starting image the build runs on (e.g. ubuntu:24.04)
    pub image: String,

    /// Recipe file
    #[arg(default_value = "recipe.toml")]
    pub recipe: PathBuf,

    /// Skip detection and target this distribution (e.g. ubuntu-24.04)
    #[arg(long)]
    pub distribution: Option<String>,

    /// Output package format (defaults by distribution flavour)
    #[arg(long, value_parser = ["deb", "rpm"])]
    pub format: Option<String>,

    /// Keep the build container instead of deleting it
    #[arg(long)]
    pub keep: bool,

    /// Replace existing output artifacts
    #[arg(long)]
    pub overwrite: bool,

    /// Package index refresh policy
    #[arg(long, value_enum, default_value = "auto")]
    pub update: UpdateMode,

    /// Source cache directory (default ~/.cache/kiln)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Container engine host (unix:///... or tcp://host:port)
    #[arg(long, env = "DOCKER_HOST")]
    pub host: Option<String>,

    /// Use TLS for a tcp engine host
    #[arg(long)]
    pub tls: bool,

    /// Verify the engine's certificate (implies --tls)
    #[arg(long)]
    pub tlsverify: bool,

    /// CA bundle for engine verification
    #[arg(long)]
    pub tlscacert: Option<PathBuf>,

    /// Client certificate presented to the engine
    #[arg(long)]
    pub tlscert: Option<PathBuf>,

    /// Client private key
    #[arg(long)]
    pub tlskey: Option<PathBuf>,
}

impl CookArgs {
    /// Whether any TLS option was requested
    pub fn wants_tls(&self) -> bool {
        self.tls
            || self.tlsverify
            || self.tlscacert.is_some()
            || self.tlscert.is_some()
            || self.tlskey.is_some()
    }
}

/// Arguments for the lint command
#[derive(Parser, Debug)]
pub struct LintArgs {
    /// Recipe file
    #[arg(default_value = "recipe.toml")]
    pub recipe: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cook_args_parse() {
        let cli = Cli::try_parse_from([
            "kiln",
            "cook",
            "ubuntu:24.04",
            "my-recipe.toml",
            "--keep",
            "--update",
            "never",
        ])
        .unwrap();
        match cli.command {
            Commands::Cook(args) => {
                assert_eq!(args.image, "ubuntu:24.04");
                assert_eq!(args.recipe, PathBuf::from("my-recipe.toml"));
                assert!(args.keep);
                assert_eq!(args.update, UpdateMode::Never);
                assert!(!args.wants_tls());
            }
            _ => panic!("expected cook"),
        }
    }

    #[test]
    fn recipe_defaults_to_recipe_toml() {
        let cli = Cli::try_parse_from(["kiln", "cook", "ubuntu:24.04"]).unwrap();
        match cli.command {
            Commands::Cook(args) => assert_eq!(args.recipe, PathBuf::from("recipe.toml")),
            _ => panic!("expected cook"),
        }
    }

    #[test]
    fn tls_flags_imply_tls() {
        let cli = Cli::try_parse_from([
            "kiln",
            "cook",
            "x",
            "--tlscacert",
            "/certs/ca.pem",
        ])
        .unwrap();
        match cli.command {
            Commands::Cook(args) => assert!(args.wants_tls()),
            _ => panic!("expected cook"),
        }
    }
}
