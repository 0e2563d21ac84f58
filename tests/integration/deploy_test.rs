use certdeploy_lib::{
    CancellationToken, CertificateManager, DedupCertificateManager, DeployError, DeployTarget,
    Deployer, DomainMatchPattern, FanOutDeployer, FanOutOptions, JobDeployer, JobOptions,
    JobState, JobVariant, PollPolicy,
};

use std::time::Duration;

use super::test_utils::{FakePlatform, KEY_PEM, counters, self_signed};

type FakeFanOut = FanOutDeployer<DedupCertificateManager<FakePlatform>, FakePlatform, FakePlatform>;

fn fan_out(platform: &FakePlatform, pattern: DomainMatchPattern, domains: &[&str]) -> FakeFanOut {
    fan_out_concurrent(platform, pattern, domains, 1)
}

fn fan_out_concurrent(
    platform: &FakePlatform,
    pattern: DomainMatchPattern,
    domains: &[&str],
    concurrency: usize,
) -> FakeFanOut {
    FanOutDeployer::new(
        DedupCertificateManager::new(platform.clone()),
        platform.clone(),
        platform.clone(),
        FanOutOptions {
            pattern,
            domains: domains.iter().map(|d| d.to_string()).collect(),
            concurrency,
        },
    )
}

const ABC: [&str; 3] = ["a.example.com", "b.example.com", "c.example.com"];

fn job(platform: &FakePlatform, options: JobOptions) -> JobDeployer<DedupCertificateManager<FakePlatform>, FakePlatform> {
    JobDeployer::new(
        DedupCertificateManager::new(platform.clone()),
        platform.clone(),
        options,
    )
}

fn immediate_job() -> JobOptions {
    JobOptions {
        policy: PollPolicy::immediate(),
        ..JobOptions::default()
    }
}

#[tokio::test]
async fn upload_twice_reuses_identity() {
    let platform = FakePlatform::new();
    platform.seed_certificate("other-1", &self_signed(&["other.test"]));
    platform.seed_certificate("other-2", &self_signed(&["another.test"]));
    let manager = DedupCertificateManager::new(platform.clone());
    let cancel = CancellationToken::new();
    let pem = self_signed(&["www.example.com"]);

    let first = manager.upload(&cancel, &pem, KEY_PEM).await.unwrap();
    let second = manager.upload(&cancel, &pem, KEY_PEM).await.unwrap();

    assert_eq!(first.cert_id, second.cert_id);
    assert_eq!(platform.state().creates, 1);
    assert_eq!(platform.state().certificates.len(), 3);
}

#[tokio::test]
async fn fan_out_reports_only_failed_target() {
    let platform = FakePlatform::new();
    platform.fail_target("b.example.com");
    let deployer = fan_out(
        &platform,
        DomainMatchPattern::Exact,
        &["a.example.com", "b.example.com", "c.example.com"],
    );
    let pem = self_signed(&["a.example.com", "b.example.com", "c.example.com"]);

    let err = deployer
        .deploy(&CancellationToken::new(), &pem, KEY_PEM)
        .await
        .unwrap_err();

    let DeployError::PartialFailure(partial) = err else {
        panic!("expected partial failure, got {err:?}");
    };
    assert_eq!(partial.attempted, 3);
    assert_eq!(partial.failed_targets(), vec!["b.example.com"]);
    assert_eq!(
        platform.bound_targets(),
        vec!["a.example.com".to_string(), "c.example.com".to_string()]
    );
}

#[tokio::test]
async fn concurrent_fan_out_reports_only_failed_target() {
    let platform = FakePlatform::new();
    platform.fail_target("b.example.com");
    platform.state().bind_delay = Some(Duration::from_millis(20));
    let deployer = fan_out_concurrent(&platform, DomainMatchPattern::Exact, &ABC, 3);

    let err = deployer
        .deploy(&CancellationToken::new(), &self_signed(&ABC), KEY_PEM)
        .await
        .unwrap_err();

    let DeployError::PartialFailure(partial) = err else {
        panic!("expected partial failure, got {err:?}");
    };
    assert_eq!(partial.attempted, 3);
    assert_eq!(partial.failed_targets(), vec!["b.example.com"]);
    assert!(!partial.was_cancelled());
    let mut bound = platform.bound_targets();
    bound.sort();
    assert_eq!(bound, vec!["a.example.com".to_string(), "c.example.com".to_string()]);
    assert_eq!(platform.state().max_binds_in_flight, 3);
}

#[tokio::test]
async fn cancel_mid_sweep_keeps_applied_binds() {
    let platform = FakePlatform::new();
    let cancel = CancellationToken::new();
    platform.state().cancel_after_bind = Some(("b.example.com".to_string(), cancel.clone()));
    let deployer = fan_out(&platform, DomainMatchPattern::Exact, &ABC);

    let err = deployer
        .deploy(&cancel, &self_signed(&ABC), KEY_PEM)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Cancelled));
    assert_eq!(
        platform.bound_targets(),
        vec!["a.example.com".to_string(), "b.example.com".to_string()]
    );
}

#[tokio::test]
async fn cancel_mid_sweep_still_reports_earlier_failures() {
    let platform = FakePlatform::new();
    let cancel = CancellationToken::new();
    platform.fail_target("a.example.com");
    platform.state().cancel_after_bind = Some(("b.example.com".to_string(), cancel.clone()));
    let deployer = fan_out(&platform, DomainMatchPattern::Exact, &ABC);

    let err = deployer
        .deploy(&cancel, &self_signed(&ABC), KEY_PEM)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    let DeployError::PartialFailure(partial) = err else {
        panic!("expected partial failure, got {err:?}");
    };
    assert_eq!(partial.failed_targets(), vec!["a.example.com", "c.example.com"]);
    assert_eq!(partial.cancelled_targets(), vec!["c.example.com"]);
    assert_eq!(platform.bound_targets(), vec!["b.example.com".to_string()]);
}

#[tokio::test]
async fn fan_out_binds_every_target_once() {
    let platform = FakePlatform::new();
    let deployer = fan_out(
        &platform,
        DomainMatchPattern::Exact,
        &["a.example.com", "A.example.com.", "b.example.com"],
    );
    let pem = self_signed(&["a.example.com", "b.example.com"]);

    let result = deployer
        .deploy(&CancellationToken::new(), &pem, KEY_PEM)
        .await
        .unwrap();

    assert_eq!(
        result.targets,
        vec![
            DeployTarget::Domain("a.example.com".into()),
            DeployTarget::Domain("b.example.com".into()),
        ]
    );
    assert!(result.job.is_none());
    let state = platform.state();
    assert!(state.bound.iter().all(|(_, id)| id == &result.upload.cert_id));
}

#[tokio::test]
async fn certsan_binds_only_covered_inventory() {
    let platform = FakePlatform::with_domains(&[
        "shop.example.com",
        "example.com",
        "deep.shop.example.com",
        "api.example.com",
        "other.test",
    ]);
    let deployer = fan_out(&platform, DomainMatchPattern::CertSan, &[]);
    let pem = self_signed(&["*.example.com"]);

    deployer
        .deploy(&CancellationToken::new(), &pem, KEY_PEM)
        .await
        .unwrap();

    assert_eq!(
        platform.bound_targets(),
        vec!["shop.example.com".to_string(), "api.example.com".to_string()]
    );
}

#[tokio::test]
async fn wildcard_pattern_selects_one_label() {
    let platform = FakePlatform::with_domains(&["a.example.com", "x.a.example.com", "example.com"]);
    let deployer = fan_out(&platform, DomainMatchPattern::Wildcard, &["*.example.com"]);
    let pem = self_signed(&["*.example.com"]);

    deployer
        .deploy(&CancellationToken::new(), &pem, KEY_PEM)
        .await
        .unwrap();

    assert_eq!(platform.bound_targets(), vec!["a.example.com".to_string()]);
}

#[tokio::test]
async fn exact_without_domains_writes_nothing() {
    let platform = FakePlatform::new();
    let deployer = fan_out(&platform, DomainMatchPattern::Exact, &[]);
    let pem = self_signed(&["www.example.com"]);

    let err = deployer
        .deploy(&CancellationToken::new(), &pem, KEY_PEM)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Config(_)));
    assert_eq!(platform.state().creates, 0);
}

#[tokio::test]
async fn cancelled_before_start_makes_no_calls() {
    let platform = FakePlatform::new();
    let deployer = fan_out(&platform, DomainMatchPattern::Exact, &["a.example.com"]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = deployer
        .deploy(&cancel, &self_signed(&["a.example.com"]), KEY_PEM)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(platform.state().creates, 0);
    assert!(platform.bound_targets().is_empty());
}

#[tokio::test]
async fn job_reports_failure_counts() {
    let platform = FakePlatform::new();
    platform.queue_observation(vec![counters(2, 1, 5, 0, 8)]);
    platform.queue_observation(vec![counters(0, 0, 7, 1, 8)]);
    let deployer = job(&platform, immediate_job());

    let err = deployer
        .deploy(&CancellationToken::new(), &self_signed(&["a.example.com"]), KEY_PEM)
        .await
        .unwrap_err();

    match err {
        DeployError::JobFailed {
            succeeded,
            failed,
            total,
            ..
        } => assert_eq!((succeeded, failed, total), (7, 1, 8)),
        other => panic!("expected job failure, got {other:?}"),
    }
    assert_eq!(platform.state().status_calls, 2);
}

#[tokio::test]
async fn job_sums_shards_until_success() {
    let platform = FakePlatform::new();
    platform.queue_observation(vec![counters(3, 0, 0, 0, 3), counters(0, 2, 0, 0, 2)]);
    platform.queue_observation(vec![counters(0, 0, 3, 0, 3), counters(0, 0, 2, 0, 2)]);
    let deployer = job(&platform, immediate_job());

    let result = deployer
        .deploy(&CancellationToken::new(), &self_signed(&["a.example.com"]), KEY_PEM)
        .await
        .unwrap();

    let summary = result.job.unwrap();
    assert_eq!(summary.state, JobState::Succeeded);
    assert_eq!((summary.succeeded, summary.total, summary.polls), (5, 5, 2));
    let state = platform.state();
    assert_eq!(state.submissions.len(), 1);
    assert_eq!(state.submissions[0].0, JobVariant::Rebind);
    assert_eq!(state.submissions[0].2, result.upload.cert_id);
    assert_eq!(state.status_variants, vec![JobVariant::Rebind, JobVariant::Rebind]);
}

#[tokio::test]
async fn replace_in_place_polls_the_same_variant() {
    let platform = FakePlatform::new();
    platform.queue_observation(vec![counters(0, 2, 0, 0, 2)]);
    platform.queue_observation(vec![counters(0, 0, 2, 0, 2)]);
    let deployer = job(
        &platform,
        JobOptions {
            variant: JobVariant::ReplaceInPlace,
            previous_cert_id: Some("cert-old".to_string()),
            resource_types: vec!["cdn".to_string()],
            ..immediate_job()
        },
    );

    deployer
        .deploy(&CancellationToken::new(), &self_signed(&["a.example.com"]), KEY_PEM)
        .await
        .unwrap();

    let state = platform.state();
    assert_eq!(state.submissions[0].0, JobVariant::ReplaceInPlace);
    assert_eq!(state.submissions[0].1.as_deref(), Some("cert-old"));
    assert_eq!(
        state.status_variants,
        vec![JobVariant::ReplaceInPlace, JobVariant::ReplaceInPlace]
    );
}

#[tokio::test]
async fn rebind_submits_configured_instances() {
    let platform = FakePlatform::new();
    platform.queue_observation(vec![counters(0, 0, 2, 0, 2)]);
    let deployer = job(
        &platform,
        JobOptions {
            instance_ids: vec!["lb-1".to_string(), "lb-2".to_string()],
            ..immediate_job()
        },
    );

    deployer
        .deploy(&CancellationToken::new(), &self_signed(&["a.example.com"]), KEY_PEM)
        .await
        .unwrap();

    assert_eq!(
        platform.state().submitted_instances,
        vec![vec!["lb-1".to_string(), "lb-2".to_string()]]
    );
}

#[tokio::test]
async fn overflowing_job_counters_are_upstream_errors() {
    let platform = FakePlatform::new();
    platform.queue_observation(vec![
        counters(0, 0, u64::MAX, 0, u64::MAX),
        counters(0, 0, 1, 0, 1),
    ]);
    let deployer = job(&platform, immediate_job());

    let err = deployer
        .deploy(&CancellationToken::new(), &self_signed(&["a.example.com"]), KEY_PEM)
        .await
        .unwrap_err();

    match err {
        DeployError::Upstream { operation, message } => {
            assert_eq!(operation, "get deployment job status");
            assert!(message.contains("overflow"));
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_during_polling_stops_before_next_poll() {
    let platform = FakePlatform::new();
    let cancel = CancellationToken::new();
    platform.state().cancel_on_status_call = Some((2, cancel.clone()));
    for _ in 0..3 {
        platform.queue_observation(vec![counters(4, 0, 0, 0, 4)]);
    }
    let deployer = job(&platform, immediate_job());

    let err = deployer
        .deploy(&cancel, &self_signed(&["a.example.com"]), KEY_PEM)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(platform.state().status_calls, 2);
}

#[tokio::test]
async fn job_gives_up_after_max_attempts() {
    let platform = FakePlatform::new();
    for _ in 0..5 {
        platform.queue_observation(vec![counters(0, 4, 0, 0, 4)]);
    }
    let deployer = job(
        &platform,
        JobOptions {
            policy: PollPolicy::immediate().with_max_attempts(3),
            ..JobOptions::default()
        },
    );

    let err = deployer
        .deploy(&CancellationToken::new(), &self_signed(&["a.example.com"]), KEY_PEM)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::JobIncomplete { attempts: 3, .. }));
    assert_eq!(platform.state().status_calls, 3);
}

#[tokio::test]
async fn replace_in_place_needs_previous_identity() {
    let platform = FakePlatform::new();
    let deployer = job(
        &platform,
        JobOptions {
            variant: JobVariant::ReplaceInPlace,
            ..immediate_job()
        },
    );

    let err = deployer
        .deploy(&CancellationToken::new(), &self_signed(&["a.example.com"]), KEY_PEM)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Config(_)));
    assert!(platform.state().submissions.is_empty());
    assert_eq!(platform.state().creates, 0);
}
