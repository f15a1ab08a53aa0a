mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{Call, FakeFilter};
use hostwall_engine::sources::initial_rules;
use hostwall_engine::{
    run_worker, ApplyJob, ApplyOutcome, ApplyQueue, BoxFuture, Chain, ChainPolicy,
    ChainReconciler, EngineSettings, PortSpec, Protocol, ReconcileError, RetryPolicy, Role, Rule,
    RuleSet, SourceError, StatusBoard, SupplementaryRules,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        spacing: Duration::from_millis(1),
    }
}

fn reconciler(filter: Arc<FakeFilter>, attempts: u32) -> ChainReconciler {
    ChainReconciler::new(
        filter,
        fast_retry(attempts),
        Role::Follower,
        |role| initial_rules(&EngineSettings::default(), role),
        StatusBoard::new(),
    )
}

fn job(chain: Chain, ports: &[u16]) -> ApplyJob {
    let mut rules = RuleSet::new(chain);
    for port in ports {
        rules.push(
            Rule::accept(chain)
                .protocol(Protocol::Tcp)
                .port(PortSpec::Single(*port)),
        );
    }
    if chain == Chain::Forward {
        rules.push(Rule::default_deny());
    }
    ApplyJob::new(rules, Role::Follower, Uuid::new_v4())
}

#[tokio::test]
async fn test_bootstrap_runs_steps_in_order() {
    let filter = Arc::new(FakeFilter::new());
    let mut reconciler = reconciler(filter.clone(), 1);

    reconciler.bootstrap_with_retry(Chain::Input).await.unwrap();

    let initial = initial_rules(&EngineSettings::default(), Role::Follower)[&Chain::Input].clone();
    assert_eq!(
        filter.calls(),
        vec![
            Call::SetPolicy("INPUT".into(), ChainPolicy::Allow),
            Call::FlushChain("INPUT".into()),
            Call::FlushChain("AGENT-INPUT".into()),
            Call::CreateChain("AGENT-INPUT".into()),
            Call::SetRules("AGENT-INPUT".into(), initial.clone()),
            Call::AppendRule("INPUT".into(), Rule::delegation(Chain::Input)),
            Call::SetPolicy("INPUT".into(), ChainPolicy::Drop),
        ]
    );
    assert_eq!(filter.policy("INPUT"), Some(ChainPolicy::Drop));
    assert_eq!(filter.rules("AGENT-INPUT"), initial);
    assert!(reconciler.is_protected(Chain::Input));
}

#[tokio::test]
async fn test_failed_drop_leaves_chain_open_and_restarts() {
    let filter = Arc::new(FakeFilter::new());
    filter.fail_when(1, |call| matches!(call, Call::SetPolicy(_, ChainPolicy::Drop)));
    let mut reconciler = reconciler(filter.clone(), 3);

    reconciler.bootstrap_with_retry(Chain::Forward).await.unwrap();

    let calls = filter.calls();
    let failed_at = calls
        .iter()
        .position(|c| *c == Call::SetPolicy("FORWARD".into(), ChainPolicy::Drop))
        .unwrap();
    // the retry starts again from step 1
    assert_eq!(
        calls[failed_at + 1],
        Call::SetPolicy("FORWARD".into(), ChainPolicy::Allow)
    );
    assert_eq!(calls[failed_at + 2], Call::FlushChain("FORWARD".into()));
    // custom chain exists on the second attempt, so no create
    assert_eq!(calls[failed_at + 3], Call::FlushChain("AGENT-FORWARD".into()));
    assert_eq!(calls.last(), Some(&Call::SetPolicy("FORWARD".into(), ChainPolicy::Drop)));
    assert_eq!(filter.policy("FORWARD"), Some(ChainPolicy::Drop));
}

#[tokio::test]
async fn test_budget_exhaustion_marks_unprotected() {
    let filter = Arc::new(FakeFilter::new());
    filter.fail_when(u32::MAX, |call| matches!(call, Call::SetPolicy(_, ChainPolicy::Drop)));
    let status = StatusBoard::new();
    let mut reconciler = ChainReconciler::new(
        filter.clone(),
        fast_retry(3),
        Role::Follower,
        |_| BTreeMap::new(),
        status.clone(),
    );

    let err = reconciler.bootstrap_with_retry(Chain::Input).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Bootstrap { attempts: 3, .. }));
    assert_eq!(filter.policy("INPUT"), Some(ChainPolicy::Allow));
    let allows = filter
        .calls()
        .iter()
        .filter(|c| **c == Call::SetPolicy("INPUT".into(), ChainPolicy::Allow))
        .count();
    assert_eq!(allows, 3);

    let chain_status = status.get(Chain::Input).await;
    assert!(!chain_status.protected);
    assert!(chain_status.last_error.is_some());
}

#[tokio::test]
async fn test_unprotected_chain_is_rearmed_by_next_job() {
    let filter = Arc::new(FakeFilter::new());
    filter.fail_when(3, |call| matches!(call, Call::SetPolicy(_, ChainPolicy::Drop)));
    let mut reconciler = reconciler(filter.clone(), 2);

    assert!(reconciler.bootstrap_with_retry(Chain::Input).await.is_err());
    assert!(!reconciler.is_protected(Chain::Input));

    // third injected failure: the single re-arm attempt fails, job dropped
    filter.clear_calls();
    let err = reconciler.apply(&job(Chain::Input, &[22])).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Bootstrap { attempts: 1, .. }));
    let job_writes = filter
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::SetRules(_, rules) if rules.len() == 1))
        .count();
    assert_eq!(job_writes, 0);

    // failures used up: bootstrap succeeds, then the job is applied
    let outcome = reconciler.apply(&job(Chain::Input, &[22])).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied { rules: 1 });
    assert!(reconciler.is_protected(Chain::Input));
    assert_eq!(filter.policy("INPUT"), Some(ChainPolicy::Drop));
    assert_eq!(filter.rules("AGENT-INPUT").len(), 1);
}

#[tokio::test]
async fn test_forward_apply_appends_deny_last() {
    let filter = Arc::new(FakeFilter::new());
    let mut reconciler = reconciler(filter.clone(), 1);
    reconciler.bootstrap_with_retry(Chain::Forward).await.unwrap();
    filter.clear_calls();

    let outcome = reconciler.apply(&job(Chain::Forward, &[80, 443])).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied { rules: 3 });

    let calls = filter.calls();
    assert_eq!(calls.len(), 2);
    match &calls[0] {
        Call::SetRules(chain, rules) => {
            assert_eq!(chain, "AGENT-FORWARD");
            assert_eq!(rules.len(), 2);
            assert!(rules.iter().all(|r| !r.is_default_deny()));
        }
        other => panic!("unexpected call {other:?}"),
    }
    assert_eq!(calls[1], Call::AppendRule("AGENT-FORWARD".into(), Rule::default_deny()));

    let installed = filter.rules("AGENT-FORWARD");
    assert!(installed.last().unwrap().is_default_deny());
}

#[tokio::test]
async fn test_unchanged_rules_are_not_rewritten() {
    let filter = Arc::new(FakeFilter::new());
    let mut reconciler = reconciler(filter.clone(), 1);
    reconciler.bootstrap_with_retry(Chain::Input).await.unwrap();

    assert!(matches!(
        reconciler.apply(&job(Chain::Input, &[22, 80])).await.unwrap(),
        ApplyOutcome::Applied { .. }
    ));
    let writes = filter.set_rules_calls("AGENT-INPUT");

    assert_eq!(
        reconciler.apply(&job(Chain::Input, &[22, 80])).await.unwrap(),
        ApplyOutcome::Unchanged
    );
    assert_eq!(filter.set_rules_calls("AGENT-INPUT"), writes);
}

#[tokio::test]
async fn test_failed_apply_forgets_committed_state() {
    let filter = Arc::new(FakeFilter::new());
    let mut reconciler = reconciler(filter.clone(), 1);
    reconciler.bootstrap_with_retry(Chain::Input).await.unwrap();
    reconciler.apply(&job(Chain::Input, &[22])).await.unwrap();

    filter.fail_when(1, |call| matches!(call, Call::SetRules(_, _)));
    let err = reconciler.apply(&job(Chain::Input, &[22, 443])).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Apply { chain: Chain::Input, .. }));
    assert!(reconciler.last_committed(Chain::Input).is_none());

    // the very same rules must be written again, not skipped
    assert_eq!(
        reconciler.apply(&job(Chain::Input, &[22])).await.unwrap(),
        ApplyOutcome::Applied { rules: 1 }
    );
}

struct ExtraForward;

impl SupplementaryRules for ExtraForward {
    fn rules_for(&self, chain: Chain) -> BoxFuture<'_, Result<Vec<Rule>, SourceError>> {
        Box::pin(async move {
            if chain != Chain::Forward {
                return Ok(Vec::new());
            }
            Ok(vec![Rule::accept(Chain::Forward)
                .on_interface("flannel.1")
                .out_interface("docker0")
                .port(PortSpec::Single(8000))])
        })
    }
}

#[tokio::test]
async fn test_supplementary_rules_merged_before_deny() {
    let filter = Arc::new(FakeFilter::new());
    let mut reconciler = reconciler(filter.clone(), 1).with_supplement(Arc::new(ExtraForward));
    reconciler.bootstrap_all().await;

    reconciler.apply(&job(Chain::Forward, &[80])).await.unwrap();
    let installed = filter.rules("AGENT-FORWARD");
    assert_eq!(installed.len(), 3);
    assert_eq!(installed[1].destination_port, Some(PortSpec::Single(8000)));
    assert!(installed[2].is_default_deny());

    reconciler.apply(&job(Chain::Input, &[22])).await.unwrap();
    assert_eq!(filter.rules("AGENT-INPUT").len(), 1);
}

#[tokio::test]
async fn test_worker_never_overlaps_writes() {
    let filter = Arc::new(FakeFilter::new().with_set_rules_delay(Duration::from_millis(5)));
    let status = StatusBoard::new();
    let worker_reconciler = ChainReconciler::new(
        filter.clone(),
        fast_retry(1),
        Role::Leader,
        |role| initial_rules(&EngineSettings::default(), role),
        status.clone(),
    );
    let queue = ApplyQueue::new();
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(run_worker(worker_reconciler, queue.clone(), cancel.clone()));

    let producers: Vec<_> = (0..8u16)
        .map(|n| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for round in 0..5u16 {
                    let chain = if (n + round) % 2 == 0 { Chain::Input } else { Chain::Forward };
                    queue.enqueue(job(chain, &[1000 + n * 10 + round])).await;
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !queue.is_empty().await || status.get(Chain::Forward).await.applies == 0 {
        assert!(tokio::time::Instant::now() < deadline, "worker made no progress");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    cancel.cancel();
    worker.await.unwrap();

    assert_eq!(filter.max_in_flight(), 1);
    assert!(status.get(Chain::Input).await.protected);
    assert!(status.get(Chain::Input).await.applies >= 1);
}

#[tokio::test]
async fn test_rearm_installs_static_rules_of_current_role() {
    let filter = Arc::new(FakeFilter::new());
    filter.fail_when(2, |call| matches!(call, Call::SetPolicy(_, ChainPolicy::Drop)));
    let mut reconciler = reconciler(filter.clone(), 2);
    assert!(reconciler.bootstrap_with_retry(Chain::Input).await.is_err());
    filter.clear_calls();

    // promoted to leader while the chain was unprotected
    let mut promoted = job(Chain::Input, &[22]);
    promoted.role = Role::Leader;
    reconciler.apply(&promoted).await.unwrap();
    assert_eq!(reconciler.role(), Role::Leader);

    let settings = EngineSettings::default();
    let leader_initial = initial_rules(&settings, Role::Leader)[&Chain::Input].clone();
    assert_ne!(leader_initial, initial_rules(&settings, Role::Follower)[&Chain::Input]);
    let bootstrap_write = filter
        .calls()
        .into_iter()
        .find_map(|call| match call {
            Call::SetRules(chain, rules) if chain == "AGENT-INPUT" => Some(rules),
            _ => None,
        })
        .unwrap();
    assert_eq!(bootstrap_write, leader_initial);
    assert_eq!(filter.rules("AGENT-INPUT").len(), 1);
}

#[tokio::test]
async fn test_rejected_rule_set_keeps_previous_rules() {
    let filter = Arc::new(FakeFilter::new());
    let mut reconciler = reconciler(filter.clone(), 1);
    reconciler.bootstrap_with_retry(Chain::Input).await.unwrap();
    reconciler.apply(&job(Chain::Input, &[22])).await.unwrap();
    let previous = filter.rules("AGENT-INPUT");

    // the filter refuses one rule in the middle of the list
    filter.fail_when(1, |call| {
        matches!(call, Call::SetRules(_, rules)
            if rules.iter().any(|r| r.destination_port == Some(PortSpec::Single(443))))
    });
    let err = reconciler
        .apply(&job(Chain::Input, &[80, 443, 8443]))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Apply { chain: Chain::Input, .. }));
    assert_eq!(filter.rules("AGENT-INPUT"), previous);
    assert_eq!(filter.policy("INPUT"), Some(ChainPolicy::Drop));

    assert_eq!(
        reconciler.apply(&job(Chain::Input, &[22, 80])).await.unwrap(),
        ApplyOutcome::Applied { rules: 2 }
    );
}
