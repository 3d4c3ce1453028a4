use crate::core::deployment::{DeployStart, LifecycleAction, action_precondition};

#[test]
fn deploy_starts_fresh_when_no_workspace_exists() {
    let start = action_precondition(LifecycleAction::Deploy, None).unwrap();
    assert_eq!(start, Some(DeployStart::Fresh));
}

#[test]
fn deploy_resumes_only_a_failed_run() {
    let start = action_precondition(LifecycleAction::Deploy, Some("failed")).unwrap();
    assert_eq!(start, Some(DeployStart::Resume));

    for status in ["succeeded", "running", "iac-applying", "decommissioning"] {
        let err = action_precondition(LifecycleAction::Deploy, Some(status)).unwrap_err();
        assert_eq!(err.kind(), "ValidationError", "status {}", status);
    }
}

#[test]
fn redeploy_requires_a_settled_deployment() {
    assert!(action_precondition(LifecycleAction::Redeploy, Some("succeeded")).is_ok());
    assert!(action_precondition(LifecycleAction::Redeploy, Some("failed")).is_ok());
    assert!(action_precondition(LifecycleAction::Redeploy, Some("building")).is_err());
    assert!(action_precondition(LifecycleAction::Redeploy, None).is_err());
}

#[test]
fn scale_requires_success() {
    assert!(action_precondition(LifecycleAction::Scale, Some("succeeded")).is_ok());
    assert!(action_precondition(LifecycleAction::Scale, Some("failed")).is_err());
    assert!(action_precondition(LifecycleAction::Scale, None).is_err());
}

#[test]
fn decommission_accepts_any_existing_state() {
    for status in ["succeeded", "failed", "waiting-rollout", "decommissioning"] {
        assert!(action_precondition(LifecycleAction::Decommission, Some(status)).is_ok());
    }
    assert!(action_precondition(LifecycleAction::Decommission, None).is_err());
}
