//! Integration tests for Vectis

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    /// Command isolated from the user's config and cache
    fn vectis(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("vectis");
        cmd.env("VECTIS_CONFIG", temp.path().join("config.toml"))
            .env("VECTIS_STORAGE", temp.path().join("storage"))
            .env_remove("RUST_LOG")
            .args(["--vendor", "debian", "--arch", "amd64"]);
        cmd
    }

    fn write(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Build and test Debian-style packages"))
            .stdout(predicate::str::contains("sbuild-tarball"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("vectis"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_includes_builtin_vendors() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("[vendors.debian]"))
            .stdout(predicate::str::contains("[vendors.ubuntu]"));
    }

    #[test]
    fn config_init_then_refuse_overwrite() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(temp.path().join("config.toml").exists());

        vectis(&temp)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--force"));
    }

    #[test]
    fn cyclic_suites_rejected() {
        let temp = TempDir::new().unwrap();
        write(
            &temp.path().join("config.toml"),
            "[vendors.debian.suites.one]\nbase = \"two\"\n[vendors.debian.suites.two]\nbase = \"one\"\n",
        );
        vectis(&temp)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cyclic"));
    }

    #[test]
    fn cache_list_empty() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No artifacts in"));

        vectis(&temp)
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn cache_list_shows_published_and_leftover_files() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("storage/amd64/debian/sid");
        std::fs::create_dir_all(&dir).unwrap();
        write(&dir.join("autopkgtest.qcow2"), "image");
        write(&dir.join("sbuild.tar.gz.new-1234"), "partial");

        vectis(&temp)
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("vm-image"))
            .stdout(predicate::str::contains("published"))
            .stdout(predicate::str::contains("building"))
            .stdout(predicate::str::contains("Total: 2 artifact(s)"));
    }

    #[test]
    fn cache_clean_removes_leftover_staging_files() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("storage/amd64/debian/sid");
        std::fs::create_dir_all(&dir).unwrap();
        write(&dir.join("autopkgtest.qcow2"), "image");
        write(&dir.join("sbuild.tar.gz.new-1234"), "partial");

        vectis(&temp)
            .args(["cache", "clean"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed 1 staging file(s)"));
        assert!(dir.join("autopkgtest.qcow2").exists());
        assert!(!dir.join("sbuild.tar.gz.new-1234").exists());

        vectis(&temp)
            .args(["cache", "clean"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No leftover staging files"));
    }

    #[test]
    fn cache_path_follows_layout() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["--suite", "bookworm", "cache", "path", "sbuild-tarball"])
            .assert()
            .success()
            .stdout(predicate::str::contains("amd64/debian/bookworm/sbuild.tar.gz"));
    }

    #[test]
    fn cache_remove_missing_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["--suite", "sid", "cache", "remove", "vm-image"])
            .assert()
            .success()
            .stdout(predicate::str::contains("not cached"));
    }

    #[test]
    fn tarball_without_image_is_missing_dependency() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["--suite", "sid", "sbuild-tarball"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Missing dependency"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn new_needs_a_derived_suite() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["--suite", "sid", "new"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("has no parent suite"));
    }

    #[test]
    fn new_without_parent_image_is_missing_dependency() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["--suite", "experimental", "new"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Missing dependency"))
            .stderr(predicate::str::contains("debian/sid"));
    }

    #[test]
    fn bootstrap_refuses_derived_suite() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["--suite", "experimental", "bootstrap"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("derived from"));
    }

    #[test]
    fn unknown_suite() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["--suite", "nonexistent", "cache", "path"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown suite debian/nonexistent"));
    }

    #[test]
    fn build_rejects_non_source_packages() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["build", "notes.txt"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("expected a .dsc"));
    }

    #[test]
    fn build_reports_missing_source() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["build", "missing_1.0-1.dsc"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Path not found"));
    }

    #[test]
    fn build_without_tarball_is_missing_dependency() {
        let temp = TempDir::new().unwrap();
        let dsc = temp.path().join("hello_1.0-1.dsc");
        write(&dsc, "Source: hello\nArchitecture: any\nFiles:\n 00 1 hello_1.0.tar.gz\n");

        vectis(&temp)
            .args(["--suite", "sid", "build"])
            .arg(&dsc)
            .assert()
            .failure()
            .stderr(predicate::str::contains("sbuild-tarball"))
            .stderr(predicate::str::contains("vectis prepare"));
    }

    #[test]
    fn piuparts_without_minbase_is_missing_dependency() {
        let temp = TempDir::new().unwrap();
        let storage = temp.path().join("storage/amd64/debian/sid");
        std::fs::create_dir_all(&storage).unwrap();
        write(&storage.join("autopkgtest.qcow2"), "image");

        vectis(&temp)
            .args(["--suite", "sid", "piuparts", "hello"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("minbase-tarball"))
            .stderr(predicate::str::contains("vectis prepare --minbase"));
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["test", "--mode", "lxc", "hello.dsc"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("expected vm or schroot"));
    }

    #[test]
    fn run_needs_a_command() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["run"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Usage: vectis run"));
    }

    #[test]
    fn run_rejects_relative_chdir() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["run", "--chdir", "somewhere", "--", "true"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--chdir"));
    }

    #[test]
    fn run_without_image_is_missing_dependency() {
        let temp = TempDir::new().unwrap();
        vectis(&temp)
            .args(["--suite", "sid", "run", "--output-dir"])
            .arg(temp.path().join("out"))
            .args(["--", "true"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Missing dependency"));
        assert!(!temp.path().join("out").exists());
    }
}
