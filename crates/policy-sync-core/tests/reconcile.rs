mod common;

use common::{
    MockArmServer, assignment, assignment_id, definition, definition_id, sync_config, write_json,
};
use policy_sync_core::{
    Operation, PolicyStatus, ResultType, SyncError, SyncMode, hash::content_hash, preview, run,
};
use tempfile::TempDir;

fn repository() -> TempDir {
    let tmp = TempDir::new().unwrap();
    write_json(tmp.path(), "policies/allowed-locations/policy.json", &definition("allowed-locations", "deny"));
    write_json(tmp.path(), "policies/audit-tags/policy.json", &definition("audit-tags", "audit"));
    write_json(
        tmp.path(),
        "policies/allowed-locations/assign.prod.json",
        &assignment("allowed-locations-prod", "allowed-locations"),
    );
    tmp
}

#[tokio::test]
async fn test_first_run_creates_everything_with_tracking() {
    let repo = repository();
    let mock = MockArmServer::start().await;
    let config = sync_config(repo.path());

    let report = run(&config, &mock.client()).await.unwrap();

    assert_eq!(report.results.len(), 3);
    assert!(report.is_success());
    assert!(report
        .results
        .iter()
        .all(|r| r.operation == Operation::Create && r.status == PolicyStatus::Succeeded));
    assert_eq!(report.results[0].result_type, ResultType::Definition);
    assert_eq!(report.results[2].result_type, ResultType::Assignment);
    assert_eq!(report.results[2].message, "assignment CREATE succeeded");

    let state = mock.state();
    let stored = state.get(&definition_id("allowed-locations")).unwrap();
    let tracking = &stored["properties"]["metadata"]["gitHubPolicy"];
    assert_eq!(tracking["repoName"], "contoso/policies");
    assert_eq!(tracking["commitSha"], "0123abcd");
    assert_eq!(tracking["filepath"], "policies/allowed-locations");

    let local: policy_sync_core::PolicyObject =
        serde_json::from_value(definition("allowed-locations", "deny")).unwrap();
    assert_eq!(tracking["digest"], content_hash(&local).unwrap());

    // definitions are written before the assignment that references them
    let puts: Vec<&String> = state.log.iter().filter(|l| l.starts_with("PUT")).collect();
    assert!(puts.last().unwrap().ends_with("/allowed-locations-prod"));
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let repo = repository();
    let mock = MockArmServer::start().await;
    let config = sync_config(repo.path());
    run(&config, &mock.client()).await.unwrap();
    let writes_after_first = mock.state().count("PUT");

    let report = run(&config, &mock.client()).await.unwrap();

    assert!(report.results.is_empty());
    assert_eq!(report.unchanged, 3);
    assert_eq!(mock.state().count("PUT"), writes_after_first);
}

#[tokio::test]
async fn test_changed_content_is_updated() {
    let repo = repository();
    let mock = MockArmServer::start().await;
    let config = sync_config(repo.path());
    run(&config, &mock.client()).await.unwrap();

    write_json(repo.path(), "policies/audit-tags/policy.json", &definition("audit-tags", "deny"));
    let report = run(&config, &mock.client()).await.unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].operation, Operation::Update);
    assert_eq!(report.results[0].path, "policies/audit-tags");
    assert_eq!(report.unchanged, 2);
    let state = mock.state();
    let stored = state.get(&definition_id("audit-tags")).unwrap();
    assert_eq!(stored["properties"]["policyRule"]["then"]["effect"], "deny");
}

#[tokio::test]
async fn test_untracked_remote_object_is_updated() {
    let repo = repository();
    let mock = MockArmServer::start().await;
    mock.state().insert(definition("audit-tags", "audit"));

    let report = run(&sync_config(repo.path()), &mock.client()).await.unwrap();

    let audit = report
        .results
        .iter()
        .find(|r| r.path == "policies/audit-tags")
        .unwrap();
    assert_eq!(audit.operation, Operation::Update);
}

#[tokio::test]
async fn test_complete_mode_rewrites_unchanged_objects() {
    let repo = repository();
    let mock = MockArmServer::start().await;
    let mut config = sync_config(repo.path());
    run(&config, &mock.client()).await.unwrap();

    config.mode = SyncMode::Complete;
    let report = run(&config, &mock.client()).await.unwrap();

    assert_eq!(report.results.len(), 3);
    assert!(report.results.iter().all(|r| r.operation == Operation::Update));
    assert_eq!(report.unchanged, 0);
}

#[tokio::test]
async fn test_unreadable_remote_object_is_reported_not_written() {
    let repo = repository();
    let mock = MockArmServer::start().await;
    mock.state().forbid(&definition_id("audit-tags"));

    let report = run(&sync_config(repo.path()), &mock.client()).await.unwrap();

    assert_eq!(report.failed(), 1);
    let failure = report.results.iter().find(|r| r.is_failed()).unwrap();
    assert_eq!(failure.path, "policies/audit-tags");
    assert!(failure.message.starts_with("AuthorizationFailed"));
    assert!(mock.state().get(&definition_id("audit-tags")).is_none());
    assert!(mock.state().get(&assignment_id("allowed-locations-prod")).is_some());
}

#[tokio::test]
async fn test_rejected_create_is_a_failed_result() {
    let repo = repository();
    let mock = MockArmServer::start().await;
    mock.state().reject_put(&definition_id("audit-tags"));

    let report = run(&sync_config(repo.path()), &mock.client()).await.unwrap();

    assert_eq!(report.failed(), 1);
    let failure = report.results.iter().find(|r| r.is_failed()).unwrap();
    assert_eq!(failure.operation, Operation::Create);
    assert_eq!(failure.message, "the policy rule cannot be changed");
}

#[tokio::test]
async fn test_enforcement_patterns_change_the_digest() {
    let repo = repository();
    let mock = MockArmServer::start().await;
    let mut config = sync_config(repo.path());
    run(&config, &mock.client()).await.unwrap();

    config.enforce = vec!["~policies/allowed-locations/assign.prod.json".into()];
    let plan = preview(&config, &mock.client()).await.unwrap();

    let assignment = plan
        .requests
        .iter()
        .find(|r| r.path.ends_with("assign.prod.json"))
        .unwrap();
    assert_eq!(assignment.operation, Operation::Update);
    let policy_sync_core::PolicyObject::Assignment(a) = &assignment.policy else {
        panic!("expected assignment");
    };
    assert_eq!(a.properties.enforcement_mode.as_deref(), Some("DoNotEnforce"));
    assert_eq!(plan.mutations().count(), 1);
}

#[tokio::test]
async fn test_preview_never_writes() {
    let repo = repository();
    let mock = MockArmServer::start().await;

    let plan = preview(&sync_config(repo.path()), &mock.client()).await.unwrap();

    assert_eq!(plan.mutations().count(), 3);
    assert_eq!(mock.state().count("PUT"), 0);
    assert_eq!(mock.state().count("GET"), 3);
}

#[tokio::test]
async fn test_malformed_policy_file_aborts_the_run() {
    let repo = repository();
    std::fs::write(repo.path().join("policies/audit-tags/policy.json"), "{ not json").unwrap();
    let mock = MockArmServer::start().await;

    let err = run(&sync_config(repo.path()), &mock.client()).await.unwrap_err();

    assert!(matches!(err, SyncError::MalformedPolicy { ref path, .. } if path == "policies/audit-tags"));
    assert!(mock.state().chunks.is_empty());
}
