use crate::core::deployment::{DeploymentRegistry, DeploymentState, can_transition};

#[test]
fn cloud_hosted_happy_path_transitions_are_allowed() {
    let path = [
        (DeploymentState::Init, DeploymentState::Cloning),
        (DeploymentState::Cloning, DeploymentState::Rendering),
        (DeploymentState::Rendering, DeploymentState::IacApplying),
        (DeploymentState::IacApplying, DeploymentState::Building),
        (DeploymentState::Building, DeploymentState::ImagePublishing),
        (
            DeploymentState::ImagePublishing,
            DeploymentState::ClusterBootstrapping,
        ),
        (
            DeploymentState::ClusterBootstrapping,
            DeploymentState::ApplyingManifests,
        ),
        (
            DeploymentState::ApplyingManifests,
            DeploymentState::WaitingRollout,
        ),
        (DeploymentState::WaitingRollout, DeploymentState::Succeeded),
    ];
    for (from, to) in path {
        assert!(
            can_transition(from, to),
            "expected transition {:?} -> {:?} to be allowed",
            from,
            to
        );
    }
}

#[test]
fn local_mode_may_skip_iac_and_publishing() {
    assert!(can_transition(
        DeploymentState::Rendering,
        DeploymentState::Building
    ));
    assert!(can_transition(
        DeploymentState::Building,
        DeploymentState::ClusterBootstrapping
    ));
}

#[test]
fn every_non_terminal_state_may_fail() {
    let non_terminal = [
        DeploymentState::Init,
        DeploymentState::Cloning,
        DeploymentState::Rendering,
        DeploymentState::IacApplying,
        DeploymentState::Building,
        DeploymentState::ImagePublishing,
        DeploymentState::ClusterBootstrapping,
        DeploymentState::ApplyingManifests,
        DeploymentState::WaitingRollout,
        DeploymentState::Decommissioning,
    ];
    for from in non_terminal {
        assert!(
            can_transition(from, DeploymentState::Failed),
            "expected {:?} -> Failed",
            from
        );
    }
}

#[test]
fn decommissioning_is_reachable_from_both_terminals() {
    assert!(can_transition(
        DeploymentState::Succeeded,
        DeploymentState::Decommissioning
    ));
    assert!(can_transition(
        DeploymentState::Failed,
        DeploymentState::Decommissioning
    ));
    assert!(can_transition(
        DeploymentState::Decommissioning,
        DeploymentState::Decommissioned
    ));
}

#[test]
fn decommissioned_is_final() {
    for to in [
        DeploymentState::Init,
        DeploymentState::Failed,
        DeploymentState::Decommissioning,
    ] {
        assert!(!can_transition(DeploymentState::Decommissioned, to));
    }
}

#[test]
fn stages_cannot_be_skipped_forward() {
    assert!(!can_transition(
        DeploymentState::Cloning,
        DeploymentState::Building
    ));
    assert!(!can_transition(
        DeploymentState::Init,
        DeploymentState::Succeeded
    ));
    assert!(!can_transition(
        DeploymentState::Building,
        DeploymentState::WaitingRollout
    ));
}

#[test]
fn status_strings_round_trip() {
    for state in [
        DeploymentState::Init,
        DeploymentState::IacApplying,
        DeploymentState::WaitingRollout,
        DeploymentState::Decommissioned,
    ] {
        assert_eq!(DeploymentState::from_status(state.as_str()), Some(state));
    }
    assert!(DeploymentState::from_status("nonsense").is_none());
}

#[test]
fn registry_refuses_a_second_run_for_an_active_id() {
    let registry = DeploymentRegistry::new();
    registry.begin("dep-1", DeploymentState::Init).unwrap();

    let err = registry.begin("dep-1", DeploymentState::Init).unwrap_err();
    assert_eq!(err.kind(), "ValidationError");

    // Another id is unaffected.
    registry.begin("dep-2", DeploymentState::Init).unwrap();

    // Once terminal, the id may be claimed again.
    registry
        .transition("dep-1", DeploymentState::Failed)
        .unwrap();
    registry.begin("dep-1", DeploymentState::Init).unwrap();
}

#[test]
fn registry_enforces_the_transition_graph() {
    let registry = DeploymentRegistry::new();
    registry.begin("dep-1", DeploymentState::Init).unwrap();
    registry
        .transition("dep-1", DeploymentState::Cloning)
        .unwrap();
    let err = registry
        .transition("dep-1", DeploymentState::Succeeded)
        .unwrap_err();
    assert_eq!(err.kind(), "ValidationError");
}
