mod cli_support;

use cli_support::{args, run_cli_json_error};
use tempfile::TempDir;

#[test]
fn test_run_without_token_fails_before_network() {
    let temp = TempDir::new().unwrap();
    let home = temp.path().to_string_lossy().to_string();

    let error = run_cli_json_error(
        &args(&["run", "--form-id", "f-1", "--json"]),
        &[("FORMSYNC_HOME", home.as_str())],
    );

    assert!(error["error"].as_str().unwrap().contains("credential"));
    assert!(!temp.path().join("jobs").join("f-1.json").exists());
}

#[test]
fn test_run_without_form_id_is_rejected() {
    let temp = TempDir::new().unwrap();
    let home = temp.path().to_string_lossy().to_string();

    // The base URL is unroutable; the trigger must fail before using it.
    let error = run_cli_json_error(
        &args(&["run", "--json"]),
        &[
            ("FORMSYNC_HOME", home.as_str()),
            ("HUBSPOT_PRIVATE_APP_TOKEN", "pat-test"),
        ],
    );

    assert!(error["error"].as_str().unwrap().contains("Missing"));
}
