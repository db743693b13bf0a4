use drx_core::{AlertCategory, EnvId, RolloutConfig, RolloutStatus};
use drx_test_utils::{erroring, healthy, TestEnv};
use drx_traffic::{PollOutcome, TrafficShiftController};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn candidate() -> EnvId {
    EnvId::new("canary-1")
}

fn stable() -> EnvId {
    EnvId::new("primary")
}

fn fast_config() -> RolloutConfig {
    RolloutConfig {
        step_percent: 10,
        required_healthy_polls: 1,
        ..RolloutConfig::default()
    }
}

#[tokio::test]
async fn error_spike_at_thirty_percent_reverts_in_one_poll() {
    let env = TestEnv::new();
    let ctl = TrafficShiftController::new(fast_config(), env.rollouts.clone(), &env.collaborators());
    ctl.start("agents", candidate(), stable(), 100).await.unwrap();

    for expected in [10, 20, 30] {
        assert_eq!(
            ctl.poll_once("agents").await.unwrap(),
            PollOutcome::Advanced { to: expected }
        );
    }

    env.control.script_health(&candidate(), [erroring(0.08)]);
    let outcome = ctl.poll_once("agents").await.unwrap();
    assert!(matches!(outcome, PollOutcome::Reverted { .. }));

    let state = ctl.status("agents").await.unwrap().unwrap();
    assert_eq!(state.current_percentage, 0);
    assert_eq!(state.status, RolloutStatus::Reverted);
    assert_eq!(state.revert_count, 1);

    let split = env.control.last_split("agents").unwrap();
    assert_eq!(split.get(&stable()), Some(&100));
    assert_eq!(split.get(&candidate()), None);

    assert_eq!(env.alerts.count(AlertCategory::RolloutReverted), 1);
}

#[tokio::test]
async fn instances_sharing_a_store_see_one_rollout() {
    let env = TestEnv::new();
    let first = TrafficShiftController::new(fast_config(), env.rollouts.clone(), &env.collaborators());
    let second = TrafficShiftController::new(fast_config(), env.rollouts.clone(), &env.collaborators());

    first.start("agents", candidate(), stable(), 20).await.unwrap();
    assert!(second.start("agents", candidate(), stable(), 20).await.is_err());

    first.poll_once("agents").await.unwrap();
    assert_eq!(
        second.poll_once("agents").await.unwrap(),
        PollOutcome::Completed
    );
    assert_eq!(
        first.poll_once("agents").await.unwrap(),
        PollOutcome::Idle {
            status: RolloutStatus::Completed
        }
    );
}

#[tokio::test]
async fn new_rollout_allowed_after_revert() {
    let env = TestEnv::new();
    let ctl = TrafficShiftController::new(fast_config(), env.rollouts.clone(), &env.collaborators());
    ctl.start("agents", candidate(), stable(), 50).await.unwrap();
    env.control.script_health(&candidate(), [erroring(0.5)]);
    ctl.poll_once("agents").await.unwrap();

    let restarted = ctl.start("agents", candidate(), stable(), 50).await.unwrap();
    assert_eq!(restarted.status, RolloutStatus::Progressing);
    assert_eq!(restarted.revert_count, 1);
}

proptest! {
    #[test]
    fn exposure_only_rises_or_resets(
        health in prop::collection::vec(any::<bool>(), 1..40),
        step in 1u8..=50,
        target in 1u8..=100,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let env = TestEnv::new();
            let config = RolloutConfig {
                step_percent: step,
                required_healthy_polls: 1,
                revert_escalation_threshold: 0,
                ..RolloutConfig::default()
            };
            let ctl = TrafficShiftController::new(config, env.rollouts.clone(), &env.collaborators());
            ctl.start("svc", candidate(), stable(), target).await.unwrap();

            let mut previous = 0u8;
            for ok in health {
                let state = ctl.status("svc").await.unwrap().unwrap();
                if !state.is_active() {
                    ctl.start("svc", candidate(), stable(), target).await.unwrap();
                    previous = 0;
                }
                let reading = if ok { healthy() } else { erroring(0.5) };
                env.control.script_health(&candidate(), [reading]);
                let outcome = ctl.poll_once("svc").await.unwrap();

                let now = ctl.status("svc").await.unwrap().unwrap().current_percentage;
                prop_assert!(now <= target);
                match outcome {
                    PollOutcome::Reverted { .. } => prop_assert_eq!(now, 0),
                    _ => {
                        prop_assert!(now >= previous);
                        prop_assert!(now - previous <= step);
                    }
                }
                previous = now;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
