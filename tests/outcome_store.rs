//! Integration tests for the outcome store: transactional recording,
//! aggregates, and the windows the learner reads.

mod helpers;

use chrono::{Duration as ChronoDuration, Utc};
use national_treasure::models::{Outcome, OutcomeKind, SCHEMA_VERSION};
use national_treasure::OutcomeStore;

use helpers::create_seeded_pool;

fn outcome_at(
    domain: &str,
    profile_id: &str,
    result: OutcomeKind,
    age: ChronoDuration,
    block_service: Option<&str>,
) -> Outcome {
    Outcome {
        schema_version: SCHEMA_VERSION,
        ts: Utc::now() - age,
        domain: domain.to_string(),
        url: format!("https://{domain}/x"),
        profile_id: profile_id.to_string(),
        result,
        block_service: block_service.map(str::to_string),
        http_status: None,
        response_ms: 900,
        content_length: 2048,
        page_title: Some("Title".to_string()),
        hour: 9,
        weekday: 4,
        recent_rate: 1,
    }
}

#[tokio::test]
async fn record_updates_profile_and_domain_aggregates() {
    let store = OutcomeStore::new(create_seeded_pool().await);

    store
        .record(&outcome_at(
            "shop.test",
            "cfg_shell_chrome_mac",
            OutcomeKind::Ok,
            ChronoDuration::zero(),
            None,
        ))
        .await
        .unwrap();
    store
        .record(&outcome_at(
            "shop.test",
            "cfg_shell_chrome_mac",
            OutcomeKind::Blocked,
            ChronoDuration::zero(),
            Some("imperva"),
        ))
        .await
        .unwrap();

    let profile = store.profile("cfg_shell_chrome_mac").await.unwrap().unwrap();
    assert_eq!(profile.attempts, 2);
    assert_eq!(profile.successes, 1);
    assert!(profile.last_success.is_some());
    assert!(profile.last_failure.is_some());
    assert!(profile.successes <= profile.attempts);

    let record = store.domain_record("shop.test").await.unwrap().unwrap();
    assert_eq!(record.sample_count, 2);
    assert_eq!(record.block_indicators, vec!["imperva".to_string()]);
}

#[tokio::test]
async fn block_indicators_are_deduplicated() {
    let store = OutcomeStore::new(create_seeded_pool().await);
    for _ in 0..3 {
        store
            .record(&outcome_at(
                "walled.test",
                "cfg_shell_chrome_mac",
                OutcomeKind::Captcha,
                ChronoDuration::zero(),
                Some("captcha"),
            ))
            .await
            .unwrap();
    }
    let record = store.domain_record("walled.test").await.unwrap().unwrap();
    assert_eq!(record.block_indicators, vec!["captcha".to_string()]);
}

#[tokio::test]
async fn arm_stats_groups_by_profile() {
    let store = OutcomeStore::new(create_seeded_pool().await);
    for _ in 0..3 {
        store
            .record(&outcome_at(
                "arms.test",
                "cfg_shell_chrome_mac",
                OutcomeKind::Ok,
                ChronoDuration::zero(),
                None,
            ))
            .await
            .unwrap();
    }
    store
        .record(&outcome_at(
            "arms.test",
            "cfg_shell_chrome_win",
            OutcomeKind::Timeout,
            ChronoDuration::zero(),
            None,
        ))
        .await
        .unwrap();

    let mut arms = store.arm_stats("arms.test").await.unwrap();
    arms.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
    assert_eq!(arms.len(), 2);

    assert_eq!(arms[0].profile_id, "cfg_shell_chrome_mac");
    assert_eq!(arms[0].successes, 3);
    assert_eq!(arms[0].failures, 0);
    assert!(arms[0].last_success.is_some());

    assert_eq!(arms[1].profile_id, "cfg_shell_chrome_win");
    assert_eq!(arms[1].successes, 0);
    assert_eq!(arms[1].failures, 1);
    assert!(arms[1].last_success.is_none());
}

#[tokio::test]
async fn recent_returns_newest_first() {
    let store = OutcomeStore::new(create_seeded_pool().await);
    for minutes in [30i64, 20, 10] {
        store
            .record(&outcome_at(
                "ordered.test",
                "cfg_shell_chrome_mac",
                if minutes == 10 { OutcomeKind::Ok } else { OutcomeKind::Error },
                ChronoDuration::minutes(minutes),
                None,
            ))
            .await
            .unwrap();
    }

    let recent = store.recent("ordered.test", 2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].result, OutcomeKind::Ok);
    assert!(recent[0].ts > recent[1].ts);
}

#[tokio::test]
async fn historical_rate_excludes_the_recent_window() {
    let store = OutcomeStore::new(create_seeded_pool().await);

    // Twenty old successes, then five fresh failures.
    for _ in 0..20 {
        store
            .record(&outcome_at(
                "hist.test",
                "cfg_shell_chrome_mac",
                OutcomeKind::Ok,
                ChronoDuration::days(5),
                None,
            ))
            .await
            .unwrap();
    }
    for _ in 0..5 {
        store
            .record(&outcome_at(
                "hist.test",
                "cfg_shell_chrome_mac",
                OutcomeKind::Blocked,
                ChronoDuration::zero(),
                Some("akamai"),
            ))
            .await
            .unwrap();
    }

    // With a window of 5 the failures are excluded entirely.
    let rate = store.historical_success_rate("hist.test", 5).await.unwrap();
    assert_eq!(rate, Some(1.0));

    // Services seen only in the window are not "historical".
    let known = store.historical_block_services("hist.test", 5).await.unwrap();
    assert!(known.is_empty());

    let none = store.historical_success_rate("unseen.test", 5).await.unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn global_stats_roll_up_all_domains() {
    let store = OutcomeStore::new(create_seeded_pool().await);
    store
        .record(&outcome_at("a.test", "cfg_shell_chrome_mac", OutcomeKind::Ok, ChronoDuration::zero(), None))
        .await
        .unwrap();
    store
        .record(&outcome_at("b.test", "cfg_shell_chrome_mac", OutcomeKind::Error, ChronoDuration::zero(), None))
        .await
        .unwrap();

    let (domains, total, rate) = store.global_stats().await.unwrap();
    assert_eq!(domains, 2);
    assert_eq!(total, 2);
    assert!((rate - 0.5).abs() < 1e-9);
}
