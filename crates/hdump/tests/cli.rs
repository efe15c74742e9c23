//! Black-box tests of the hdump binary.

use assert_cmd::Command;

#[test]
fn version_reports_the_library_version() {
    let output = Command::cargo_bin("hdump")
        .unwrap()
        .arg("version")
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    assert!(stdout.starts_with("hdump "));
}

#[test]
fn capture_writes_a_dump_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("cli.hprof");

    Command::cargo_bin("hdump")
        .unwrap()
        .args(["capture", "--out"])
        .arg(&out)
        .args(["--reason", "cli-test"])
        .assert()
        .success();

    let contents = std::fs::read_to_string(&out).unwrap();
    assert!(contents.contains("Size:"));
}

#[test]
fn capture_outside_supported_window_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("unsupported.hprof");

    Command::cargo_bin("hdump")
        .unwrap()
        .args(["capture", "--out"])
        .arg(&out)
        .args(["--abi-level", "31"])
        .assert()
        .failure();
    assert!(!out.exists());
}

#[test]
fn report_summarizes_a_minimal_file() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report.json");
    std::fs::write(
        &report,
        r#"{
            "runningInfo": {"dumpReason": "thread_over_threshold", "threadCount": "812"},
            "gcPaths": [{
                "instanceCount": 4,
                "leakReason": "held by static cache",
                "gcRoot": "Static field",
                "signature": "abcdef012345abcdef",
                "path": [{
                    "reference": "com.example.Cache.sEntries",
                    "referenceType": "STATIC_FIELD",
                    "declaredClass": "com.example.Cache"
                }]
            }],
            "analysisDone": true,
            "reAnalysisTimes": 1
        }"#,
    )
    .unwrap();

    let output = Command::cargo_bin("hdump")
        .unwrap()
        .arg("report")
        .arg(&report)
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    assert!(stdout.contains("thread_over_threshold"));
    assert!(stdout.contains("held by static cache"));
    assert!(stdout.contains("1 reference chain(s)"));
}
