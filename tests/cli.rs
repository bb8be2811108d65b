use std::fs;

use assert_cmd::Command;
use tempfile::tempdir;

fn assetpipe() -> Command {
    Command::cargo_bin("assetpipe").expect("binary present")
}

#[test]
fn list_stages_prints_registry() {
    let output = assetpipe().arg("list-stages").assert().success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    assert!(stdout.starts_with("Available stages:"));
    for stage in ["bundle_js", "transpile_js", "minify_css", "optimize_image", "write"] {
        assert!(stdout.contains(&format!("- {stage}")), "missing {stage}");
    }
}

#[test]
fn clean_exits_zero_and_removes_dist() {
    let temp = tempdir().unwrap();
    fs::create_dir_all(temp.path().join("dist/img")).unwrap();
    fs::write(temp.path().join("dist/img/old.png"), b"x").unwrap();

    assetpipe()
        .current_dir(temp.path())
        .arg("clean")
        .assert()
        .success();

    assert!(!temp.path().join("dist").exists());
}

#[test]
fn init_then_build_writes_report() {
    let temp = tempdir().unwrap();
    assetpipe()
        .current_dir(temp.path())
        .arg("init")
        .assert()
        .success();
    assert!(temp.path().join("assetpipe.yaml").is_file());

    assetpipe()
        .current_dir(temp.path())
        .arg("validate")
        .assert()
        .success();

    assetpipe()
        .current_dir(temp.path())
        .args(["build", "--report", "build.json"])
        .assert()
        .success();

    let dist = temp.path().join("dist");
    assert!(dist.join("index.html").is_file());
    assert!(dist.join("main.min.css").is_file());
    assert!(dist.join("index.min.js").is_file());

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join("build.json")).unwrap())
            .unwrap();
    assert_eq!(report["succeeded"], true);
    let files = report["files"].as_array().unwrap();
    for map in ["main.min.css.map", "index.min.js.map"] {
        assert!(files.iter().any(|file| file["path"] == map), "missing {map}");
    }

    assetpipe()
        .current_dir(temp.path())
        .arg("init")
        .assert()
        .failure();
}

#[test]
fn failing_task_exits_non_zero() {
    let temp = tempdir().unwrap();
    fs::create_dir_all(temp.path().join("src/styles")).unwrap();
    fs::write(temp.path().join("src/styles/main.scss"), ".a { color: ").unwrap();

    assetpipe()
        .current_dir(temp.path())
        .arg("style")
        .assert()
        .code(1);

    assetpipe()
        .current_dir(temp.path())
        .arg("build")
        .assert()
        .code(1);
}

#[test]
fn unknown_task_is_rejected() {
    let temp = tempdir().unwrap();
    assetpipe()
        .current_dir(temp.path())
        .args(["run", "fonts"])
        .assert()
        .failure();
}

#[test]
fn invalid_config_fails_validation() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("assetpipe.yaml"),
        "version: 1\ntasks:\n  - name: html\n    inputs: ['*.html']\n    stages:\n      - stage: teleport\n",
    )
    .unwrap();

    assetpipe()
        .current_dir(temp.path())
        .arg("validate")
        .assert()
        .failure();

    assetpipe()
        .current_dir(temp.path())
        .arg("html")
        .assert()
        .failure();
}

#[test]
fn src_and_dist_flags_override_defaults() {
    let temp = tempdir().unwrap();
    fs::create_dir_all(temp.path().join("site")).unwrap();
    fs::write(temp.path().join("site/about.html"), "<p> about </p>").unwrap();

    assetpipe()
        .current_dir(temp.path())
        .args(["--src", "site", "--dist", "public", "html"])
        .assert()
        .success();

    assert!(temp.path().join("public/about.html").is_file());
}
