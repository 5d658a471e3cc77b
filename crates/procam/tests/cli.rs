use assert_cmd::Command;
use predicates::prelude::*;

fn procam() -> Command {
    Command::cargo_bin("procam").unwrap()
}

#[test]
fn generate_decode_and_fit_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let frames = dir.path().join("frames");
    let data_set = dir.path().join("scan.gcds");
    let previews = dir.path().join("previews");

    procam()
        .args(["generate", "--projector", "16x8", "--out"])
        .arg(&frames)
        .assert()
        .success();
    // white, black, 3 row planes, 4 column planes
    assert_eq!(std::fs::read_dir(&frames).unwrap().count(), 9);

    // the projected frames double as a perfect capture
    procam()
        .args(["decode", "--projector", "16x8", "--frames"])
        .arg(&frames)
        .arg("--out")
        .arg(&data_set)
        .arg("--previews")
        .arg(&previews)
        .assert()
        .success();
    assert!(data_set.exists());
    assert!(previews.join("median_inverse.png").exists());

    let output = procam()
        .arg("homography")
        .arg("--data-set")
        .arg(&data_set)
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["inliers"], 128);
    assert!(report["rms"].as_f64().unwrap() < 1e-6);
}

#[test]
fn wrong_projector_size_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let frames = dir.path().join("frames");
    procam()
        .args(["generate", "--projector", "16x8", "--out"])
        .arg(&frames)
        .assert()
        .success();

    procam()
        .args(["decode", "--projector", "64x8", "--frames"])
        .arg(&frames)
        .arg("--out")
        .arg(dir.path().join("scan.gcds"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("frame count"));
}

#[test]
fn malformed_size_is_rejected_by_the_parser() {
    procam()
        .args(["generate", "--projector", "16by8", "--out", "unused"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("WIDTHxHEIGHT"));
}

#[test]
fn log_level_accepts_per_target_overrides() {
    let dir = tempfile::tempdir().unwrap();
    procam()
        .env_remove("RUST_LOG")
        .args(["--log-level", "warn,procam=info", "generate", "--projector", "16x8"])
        .arg("--out")
        .arg(dir.path().join("loud"))
        .assert()
        .success()
        .stderr(predicate::str::contains("wrote 9 frames"));

    procam()
        .env_remove("RUST_LOG")
        .args(["--log-level", "info,procam=off", "generate", "--projector", "16x8"])
        .arg("--out")
        .arg(dir.path().join("quiet"))
        .assert()
        .success()
        .stderr(predicate::str::contains("wrote").not());
}

#[test]
fn unknown_log_level_is_rejected() {
    procam()
        .args(["--log-level", "procam=loud", "generate", "--projector", "16x8"])
        .args(["--out", "unused"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown log level"));
}
