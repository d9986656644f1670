//! Per-domain configuration learning: Thompson sampling over browser
//! profiles as bandit arms.
//!
//! Each arm carries a Beta posterior parameterized by decay-weighted
//! success and failure counts, so the bandit stays adaptive when a site
//! changes its defenses without throwing history away. Cold start borrows
//! from similar domains; drift detection compares the recent window against
//! the historical success rate and surfaces signals to the caller instead
//! of acting on them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::Rng;
use rand_distr::{Beta, Distribution};

use crate::models::{BrowserProfile, Outcome, OutcomeKind, SCHEMA_VERSION};
use crate::storage::outcomes::{ArmSample, OutcomeStore};

/// How many similar domains cold start consults.
const COLD_START_NEIGHBORS: u32 = 5;
/// A neighbor's best profile is adopted only above this confidence.
const COLD_START_CONFIDENCE: f64 = 0.7;
/// How many historical samples parameterize the posteriors.
const SAMPLE_DEPTH: u32 = 500;
/// Outcomes examined by the drift check's recent window.
const DRIFT_WINDOW: u32 = 10;
/// How long a drift signal keeps the exploration bonus doubled.
const DRIFT_BOOST: Duration = Duration::from_secs(600);

/// Signals surfaced by [`DomainLearner::check_drift`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriftSignal {
    /// Historical success collapsed in the recent window.
    Drift { historical: f64, recent: f64 },
    /// A block attribution never seen before for this domain.
    NewBlock { service: String },
}

/// Decay-weighted posterior parameters for one arm.
#[derive(Debug, Clone)]
struct ArmPosterior {
    profile_id: String,
    weighted_successes: f64,
    weighted_failures: f64,
    raw_count: u32,
    last_success: Option<DateTime<Utc>>,
}

/// Extra context recorded with an outcome.
#[derive(Debug, Clone, Default)]
pub struct OutcomeDetails {
    pub url: String,
    pub block_service: Option<String>,
    pub http_status: Option<u16>,
    pub response_ms: u64,
    pub content_length: u64,
    pub page_title: Option<String>,
}

/// Chooses profiles for domains and ingests what happened.
pub struct DomainLearner {
    store: OutcomeStore,
    exploration_threshold: u32,
    exploration_bonus: f64,
    half_life_days: f64,
    /// Domains under a drift boost, with expiry. In-memory only.
    drift_boost: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DomainLearner {
    pub fn new(
        store: OutcomeStore,
        exploration_threshold: u32,
        exploration_bonus: f64,
        half_life_days: f64,
    ) -> Self {
        DomainLearner {
            store,
            exploration_threshold,
            exploration_bonus,
            half_life_days,
            drift_boost: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &OutcomeStore {
        &self.store
    }

    /// Proposes a profile for the domain: one Beta sample per arm, an
    /// additive exploration bonus for under-sampled arms, ties broken by
    /// most recent success.
    pub async fn select(&self, domain: &str) -> Result<BrowserProfile> {
        let samples = self.store.arm_samples(domain, SAMPLE_DEPTH).await?;
        if samples.is_empty() {
            return self.cold_start(domain).await;
        }

        let now = Utc::now();
        let arms = decayed_posteriors(&samples, now, self.half_life_days);
        let bonus = self.current_bonus(domain);

        // The rng is thread-local and must not live across an await.
        let chosen = {
            let mut rng = rand::thread_rng();
            let mut best: Option<(f64, Option<DateTime<Utc>>, &ArmPosterior)> = None;
            for arm in arms.values() {
                let mut sample =
                    sample_beta(&mut rng, arm.weighted_successes, arm.weighted_failures);
                if arm.raw_count < self.exploration_threshold {
                    sample += bonus;
                }
                let candidate = (sample, arm.last_success, arm);
                best = match best {
                    None => Some(candidate),
                    Some(current) => {
                        if sample > current.0
                            || (sample == current.0 && arm.last_success > current.1)
                        {
                            Some(candidate)
                        } else {
                            Some(current)
                        }
                    }
                };
            }
            best.map(|(_, _, arm)| arm.profile_id.clone())
        };

        match chosen {
            Some(profile_id) => match self.store.profile(&profile_id).await? {
                Some(profile) => Ok(profile),
                // The catalog changed underneath the history.
                None => self.cold_start(domain).await,
            },
            None => self.cold_start(domain).await,
        }
    }

    /// Picks a profile for a domain with no history: adopt a confident
    /// neighbor's best profile, else fall back to the globally best one.
    async fn cold_start(&self, domain: &str) -> Result<BrowserProfile> {
        let neighbors = self
            .store
            .similar_domains(domain, COLD_START_NEIGHBORS)
            .await?;
        for (neighbor, score) in neighbors {
            let Some(record) = self.store.domain_record(&neighbor).await? else {
                continue;
            };
            if record.confidence < COLD_START_CONFIDENCE {
                continue;
            }
            if let Some(best_id) = record.best_profile_id {
                if let Some(profile) = self.store.profile(&best_id).await? {
                    log::debug!(
                        "Cold start for {domain}: adopting {} from {neighbor} (score {score:.2})",
                        profile.name
                    );
                    return Ok(profile);
                }
            }
        }

        match self.store.global_best_profile().await? {
            Some(profile) => Ok(profile),
            None => bail!("No browser profiles in the catalog"),
        }
    }

    /// Records the outcome of using `profile` against `domain` and, when a
    /// well-sampled arm dominates, repoints the domain's best profile at it.
    pub async fn record(
        &self,
        domain: &str,
        profile: &BrowserProfile,
        result: OutcomeKind,
        details: OutcomeDetails,
    ) -> Result<()> {
        let now = Utc::now();
        let recent_rate = self
            .store
            .attempts_since(domain, now - chrono::Duration::seconds(60))
            .await
            .unwrap_or(0);

        let outcome = Outcome {
            schema_version: SCHEMA_VERSION,
            ts: now,
            domain: domain.to_string(),
            url: details.url,
            profile_id: profile.id.clone(),
            result,
            block_service: details.block_service,
            http_status: details.http_status,
            response_ms: details.response_ms,
            content_length: details.content_length,
            page_title: details.page_title,
            hour: now.hour() as u8,
            weekday: now.weekday().num_days_from_monday() as u8,
            recent_rate,
        };
        self.store
            .record(&outcome)
            .await
            .context("Failed to record outcome")?;

        self.refresh_best(domain).await
    }

    /// Maintains `best_profile_id`/`confidence`. A domain with no best yet
    /// adopts the highest-mean arm outright; an incumbent keeps its
    /// confidence tracking its posterior mean and is displaced only by a
    /// challenger that dominates with at least 10 samples.
    async fn refresh_best(&self, domain: &str) -> Result<()> {
        let arms = self.store.arm_stats(domain).await?;
        if arms.is_empty() {
            return Ok(());
        }
        let posterior_mean = |successes: u64, failures: u64| {
            (successes as f64 + 1.0) / ((successes + failures) as f64 + 2.0)
        };

        let current = self
            .store
            .domain_record(domain)
            .await?
            .and_then(|r| r.best_profile_id);

        match current {
            None => {
                let best = arms
                    .iter()
                    .map(|arm| (posterior_mean(arm.successes, arm.failures), arm))
                    .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                if let Some((mean, arm)) = best {
                    self.store
                        .update_best_profile(domain, &arm.profile_id, mean)
                        .await?;
                }
            }
            Some(current_id) => {
                let current_mean = arms
                    .iter()
                    .find(|arm| arm.profile_id == current_id)
                    .map(|arm| posterior_mean(arm.successes, arm.failures))
                    .unwrap_or(0.0);

                let challenger = arms
                    .iter()
                    .filter(|arm| {
                        arm.profile_id != current_id && arm.successes + arm.failures >= 10
                    })
                    .map(|arm| (posterior_mean(arm.successes, arm.failures), arm))
                    .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

                match challenger {
                    Some((mean, arm)) if mean > current_mean => {
                        log::info!(
                            "Domain {domain}: {} displaces {current_id} (posterior {mean:.3})",
                            arm.profile_id
                        );
                        self.store
                            .update_best_profile(domain, &arm.profile_id, mean)
                            .await?;
                    }
                    _ => {
                        self.store
                            .update_best_profile(domain, &current_id, current_mean)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Compares the last [`DRIFT_WINDOW`] outcomes against the historical
    /// rate and reports drift and never-before-seen block services. Any
    /// signal doubles the exploration bonus for this domain for a while.
    pub async fn check_drift(&self, domain: &str) -> Result<Vec<DriftSignal>> {
        let mut signals = Vec::new();

        let recent = self.store.recent(domain, DRIFT_WINDOW).await?;
        if recent.is_empty() {
            return Ok(signals);
        }
        let recent_rate = recent
            .iter()
            .filter(|o| o.result.is_success())
            .count() as f64
            / recent.len() as f64;

        if let Some(historical) = self
            .store
            .historical_success_rate(domain, DRIFT_WINDOW)
            .await?
        {
            if historical >= 0.8 && recent_rate <= 0.3 {
                signals.push(DriftSignal::Drift {
                    historical,
                    recent: recent_rate,
                });
            }
        }

        let known = self
            .store
            .historical_block_services(domain, DRIFT_WINDOW)
            .await?;
        for outcome in &recent {
            if let Some(service) = &outcome.block_service {
                if !known.iter().any(|s| s == service)
                    && !signals
                        .iter()
                        .any(|s| matches!(s, DriftSignal::NewBlock { service: seen } if seen == service))
                {
                    signals.push(DriftSignal::NewBlock {
                        service: service.clone(),
                    });
                }
            }
        }

        if !signals.is_empty() {
            log::warn!("Drift detected for {domain}: {signals:?}");
            let mut boosts = self.drift_boost.lock().unwrap_or_else(|e| e.into_inner());
            boosts.insert(
                domain.to_string(),
                Utc::now() + chrono::Duration::from_std(DRIFT_BOOST).unwrap_or_default(),
            );
        }
        Ok(signals)
    }

    /// How long the caller must wait before hitting this domain again,
    /// honoring the learned minimum delay and per-minute cap.
    pub async fn should_wait(&self, domain: &str) -> Result<Duration> {
        let record = self
            .store
            .domain_record(domain)
            .await?
            .unwrap_or_else(|| crate::models::DomainRecord::new(domain));
        let (min_delay_ms, max_per_minute) = (record.min_delay_ms, record.max_per_minute);

        let now = Utc::now();
        let mut wait = Duration::ZERO;

        if let Some(last) = self.store.last_attempt_at(domain).await? {
            let elapsed = (now - last).num_milliseconds().max(0) as u64;
            if elapsed < min_delay_ms {
                wait = Duration::from_millis(min_delay_ms - elapsed);
            }
        }

        let window_start = now - chrono::Duration::seconds(60);
        let in_window = self.store.attempts_since(domain, window_start).await?;
        if in_window >= max_per_minute {
            if let Some(oldest) = self.store.oldest_attempt_since(domain, window_start).await? {
                let frees_in = (oldest + chrono::Duration::seconds(60) - now)
                    .num_milliseconds()
                    .max(0) as u64;
                wait = wait.max(Duration::from_millis(frees_in));
            }
        }

        Ok(wait)
    }

    /// Per-arm summary for operator inspection.
    pub async fn insights(&self, domain: &str) -> Result<Vec<(String, u64, u64)>> {
        let arms = self.store.arm_stats(domain).await?;
        Ok(arms
            .into_iter()
            .map(|arm| (arm.profile_id, arm.successes, arm.failures))
            .collect())
    }

    fn current_bonus(&self, domain: &str) -> f64 {
        let mut boosts = self.drift_boost.lock().unwrap_or_else(|e| e.into_inner());
        match boosts.get(domain) {
            Some(until) if *until > Utc::now() => self.exploration_bonus * 2.0,
            Some(_) => {
                boosts.remove(domain);
                self.exploration_bonus
            }
            None => self.exploration_bonus,
        }
    }
}

/// Folds raw samples into per-arm posteriors with exponential decay:
/// a sample `age_days` old weighs `exp(-ln 2 * age_days / half_life)`.
fn decayed_posteriors(
    samples: &[ArmSample],
    now: DateTime<Utc>,
    half_life_days: f64,
) -> HashMap<String, ArmPosterior> {
    let mut arms: HashMap<String, ArmPosterior> = HashMap::new();
    for sample in samples {
        let age_days = (now - sample.ts).num_seconds().max(0) as f64 / 86_400.0;
        let weight = (-std::f64::consts::LN_2 * age_days / half_life_days).exp();

        let arm = arms
            .entry(sample.profile_id.clone())
            .or_insert_with(|| ArmPosterior {
                profile_id: sample.profile_id.clone(),
                weighted_successes: 0.0,
                weighted_failures: 0.0,
                raw_count: 0,
                last_success: None,
            });
        arm.raw_count += 1;
        if sample.ok {
            arm.weighted_successes += weight;
            if arm.last_success.map_or(true, |t| sample.ts > t) {
                arm.last_success = Some(sample.ts);
            }
        } else {
            arm.weighted_failures += weight;
        }
    }
    arms
}

/// One draw from `Beta(1 + successes, 1 + failures)`.
fn sample_beta<R: Rng>(rng: &mut R, successes: f64, failures: f64) -> f64 {
    match Beta::new(1.0 + successes, 1.0 + failures) {
        Ok(beta) => beta.sample(rng),
        // Degenerate parameters only occur on NaN weights; fall back to
        // an uninformative draw.
        Err(_) => rng.gen(),
    }
}
