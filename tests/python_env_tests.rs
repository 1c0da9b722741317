//! Integration tests for site-directory scanning and argument rendering

use pyengine::python::{argument_text, PythonEnv};
use serde_json::json;
use std::path::Path;
use tempfile::tempdir;

/// Create metadata directories under the environment's site directory.
fn populate_site(home: &Path, entries: &[&str]) {
    let site = home.join("Lib").join("site-packages");
    for entry in entries {
        std::fs::create_dir_all(site.join(entry)).unwrap();
    }
}

#[test]
fn list_installed_packages_scans_metadata() {
    let dir = tempdir().unwrap();
    let env = PythonEnv::new(dir.path().to_path_buf());
    populate_site(
        dir.path(),
        &[
            "requests-2.31.0.dist-info",
            "legacy_pkg-0.1.egg-info",
            "setuptools-69.0.0.dist-info",
            // Plain package directories carry no metadata and are skipped.
            "numpy",
        ],
    );

    let packages = env.list_installed_packages();
    assert_eq!(packages, vec!["legacy_pkg", "requests", "setuptools"]);
}

#[test]
fn duplicate_names_dedupe_case_insensitively() {
    let dir = tempdir().unwrap();
    let env = PythonEnv::new(dir.path().to_path_buf());
    populate_site(
        dir.path(),
        &["REQUESTS-2.30.0.egg-info", "requests-2.31.0.dist-info"],
    );

    let packages = env.list_installed_packages();
    // First occurrence in scan order wins.
    assert_eq!(packages, vec!["REQUESTS"]);
}

#[test]
fn empty_or_missing_site_directory_lists_nothing() {
    let dir = tempdir().unwrap();
    let env = PythonEnv::new(dir.path().to_path_buf());
    assert!(env.list_installed_packages().is_empty());
}

#[test]
fn package_version_comes_from_metadata_name() {
    let dir = tempdir().unwrap();
    let env = PythonEnv::new(dir.path().to_path_buf());
    populate_site(
        dir.path(),
        &["requests-2.31.0.dist-info", "versionless.egg-info"],
    );

    assert_eq!(env.package_version("requests").as_deref(), Some("2.31.0"));
    assert_eq!(env.package_version("Requests").as_deref(), Some("2.31.0"));
    assert_eq!(env.package_version("versionless"), None);
    assert_eq!(env.package_version("absent"), None);
}

#[test]
fn installed_check_normalizes_dashes_and_case() {
    let dir = tempdir().unwrap();
    let env = PythonEnv::new(dir.path().to_path_buf());
    populate_site(dir.path(), &["legacy_pkg-0.1.dist-info"]);

    assert!(env.is_package_installed("legacy_pkg"));
    assert!(env.is_package_installed("legacy-pkg"));
    assert!(env.is_package_installed("Legacy-Pkg"));
    assert!(!env.is_package_installed("legacy"));
}

#[test]
fn remove_package_deletes_directory_and_metadata() {
    let dir = tempdir().unwrap();
    let env = PythonEnv::new(dir.path().to_path_buf());
    let site = dir.path().join("Lib").join("site-packages");

    populate_site(
        dir.path(),
        &["requests", "requests-2.31.0.dist-info", "other-1.0.dist-info"],
    );
    std::fs::write(site.join("requests").join("__init__.py"), "").unwrap();

    let removed = env.remove_package("requests").unwrap();
    assert_eq!(removed.len(), 2);
    assert!(!site.join("requests").exists());
    assert!(!site.join("requests-2.31.0.dist-info").exists());
    assert!(site.join("other-1.0.dist-info").exists());
    assert!(!env.is_package_installed("requests"));
}

#[test]
fn remove_absent_package_is_a_clean_noop() {
    let dir = tempdir().unwrap();
    let env = PythonEnv::new(dir.path().to_path_buf());
    populate_site(dir.path(), &["other-1.0.dist-info"]);

    let removed = env.remove_package("requests").unwrap();
    assert!(removed.is_empty());
}

#[test]
fn argument_rendering_for_sys_argv() {
    assert_eq!(argument_text(&json!("plain text")), "plain text");
    assert_eq!(argument_text(&json!(42)), "42");
    assert_eq!(argument_text(&json!(-7)), "-7");
    assert_eq!(argument_text(&json!(2.5)), "2.5");
    assert_eq!(argument_text(&json!(true)), "true");
    assert_eq!(argument_text(&json!(false)), "false");
    assert_eq!(argument_text(&json!(null)), "null");
}
