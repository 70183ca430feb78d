//! Integration tests for Kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn kiln() -> Command {
        cargo_bin_cmd!("kiln")
    }

    const RECIPE: &str = r#"
name = "hello"
version = "2.12"

[source]
url = "https://example.com/hello-2.12.tar.gz"

[[steps]]
name = "build"
run = "make"
"#;

    #[test]
    fn help_displays() {
        kiln()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Container Package Builder"));
    }

    #[test]
    fn version_displays() {
        kiln()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn cook_missing_recipe_fails_before_engine_contact() {
        kiln()
            .args(["cook", "ubuntu:24.04", "/no/such/recipe.toml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Recipe not found"));
    }

    #[test]
    fn lint_missing_recipe() {
        kiln()
            .args(["lint", "/no/such/recipe.toml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Recipe not found"));
    }

    #[test]
    fn lint_clean_recipe() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recipe.toml");
        fs::write(&path, RECIPE).unwrap();

        kiln()
            .args(["lint", path.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("lints clean"));
    }

    #[test]
    fn lint_reports_problems() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recipe.toml");
        fs::write(&path, "name = \"x\"\nversion = \"1\"\n").unwrap();

        kiln()
            .args(["lint", path.to_str().unwrap()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("no build steps"));
    }

    #[test]
    fn cook_rejects_unknown_format() {
        kiln()
            .args(["cook", "ubuntu:24.04", "--format", "pkgng"])
            .assert()
            .failure();
    }

    #[test]
    fn cook_unreachable_engine_fails_with_hint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recipe.toml");
        fs::write(&path, RECIPE).unwrap();

        kiln()
            .args([
                "cook",
                "ubuntu:24.04",
                path.to_str().unwrap(),
                "--host",
                "unix:///nonexistent/kiln-test.sock",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn tls_on_unix_socket_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recipe.toml");
        fs::write(&path, RECIPE).unwrap();

        kiln()
            .args([
                "cook",
                "ubuntu:24.04",
                path.to_str().unwrap(),
                "--host",
                "unix:///var/run/docker.sock",
                "--tls",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("tcp://"));
    }
}
