// Copyright 2025 Lorestore Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Pattern learning over (context → outcome) observations
//!
//! A pattern is keyed by its context signature and outcome. Confidence starts
//! at the prior and moves toward each new outcome with an exponential moving
//! average:
//!
//! ```text
//! c' = c + α · (success − c)
//! ```
//!
//! Patterns that have not been observed for longer than the stale horizon
//! decay back toward the prior when read:
//!
//! ```text
//! effective = prior + (c − prior) · 0.5^(excess / half_life)
//! ```
//!
//! Decay is a pure function of the stored confidence, `last_seen` and the
//! read time. Nothing is written back.

use crate::config::LearningConfig;
use chrono::{DateTime, Utc};
use lorestore_core::{Entity, EntityKind, LorestoreError, PropertyValue, Properties, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Normalized context: lowercase keys and values, trimmed, no empties
pub type Context = BTreeMap<String, String>;

const SIGNATURE_SEPARATOR: &str = " ∧ ";
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Normalize a raw context map
pub fn normalize_context<K, V, I>(raw: I) -> Context
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    raw.into_iter()
        .map(|(k, v)| (k.as_ref().trim().to_lowercase(), v.as_ref().trim().to_lowercase()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect()
}

/// `key=value` pairs sorted by key, joined with ` ∧ `
pub fn signature(context: &Context) -> String {
    context
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(SIGNATURE_SEPARATOR)
}

/// Learned association between a context and an outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub signature: String,
    pub context: Context,
    pub outcome: String,
    /// Stored confidence, before decay
    pub confidence: f64,
    pub support_count: u64,
    pub success_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Pattern {
    /// True when every pair of this pattern's context appears in `features`
    pub fn matches(&self, features: &Context) -> bool {
        self.context
            .iter()
            .all(|(k, v)| features.get(k).map_or(false, |f| f == v))
    }

    pub fn failure_count(&self) -> u64 {
        self.support_count - self.success_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternState {
    /// Seen once
    Observed,
    /// Seen more than once and recently
    Reinforced,
    /// Past the stale horizon, decaying toward the prior
    Stale,
}

/// A pattern as seen at read time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternView {
    #[serde(flatten)]
    pub pattern: Pattern,
    pub effective_confidence: f64,
    pub state: PatternState,
}

/// Pattern query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternFilter {
    /// Every pair must appear in the pattern's context
    pub context: Context,
    pub outcome: Option<String>,
    pub min_support: u64,
    pub min_confidence: f64,
}

/// A caller's recommendation before learning is applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseRecommendation {
    pub recommendation: String,
    pub confidence: f64,
    /// Evidence behind the base (configured default when unset)
    #[serde(default)]
    pub support: Option<u64>,
}

impl BaseRecommendation {
    pub fn new(recommendation: impl Into<String>, confidence: f64) -> Self {
        Self {
            recommendation: recommendation.into(),
            confidence,
            support: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImprovedRecommendation {
    pub recommendation: String,
    pub confidence: f64,
    pub insights: Vec<String>,
    /// Signature of the pattern that was applied
    pub pattern: Option<String>,
}

/// One (context → outcome) observation
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub context: Context,
    pub outcome: String,
    pub success: bool,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(context: Context, outcome: impl Into<String>, success: bool) -> Self {
        Self {
            context,
            outcome: outcome.into(),
            success,
            observed_at: Utc::now(),
        }
    }

    pub fn at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.context.is_empty() {
            return Err(LorestoreError::validation("learning context must not be empty"));
        }
        if self.outcome.is_empty() {
            return Err(LorestoreError::validation("learning outcome must not be empty"));
        }
        Ok(())
    }

    /// Persistable form: an `observation` entity
    pub fn to_entity(&self, id: impl Into<String>) -> Entity {
        let context: Properties = self
            .context
            .iter()
            .map(|(k, v)| (k.clone(), PropertyValue::from(v.as_str())))
            .collect();
        Entity::new(id, EntityKind::Observation)
            .with_property("context", PropertyValue::Map(context))
            .with_property("outcome", self.outcome.as_str())
            .with_property("success", self.success)
            .at(self.observed_at)
    }

    /// Read an observation back from its entity; `None` for other entities
    pub fn from_entity(entity: &Entity) -> Option<Observation> {
        if entity.kind != EntityKind::Observation {
            return None;
        }
        let context = match entity.property("context")? {
            PropertyValue::Map(map) => normalize_context(
                map.iter()
                    .filter_map(|(k, v)| v.scalar_string().map(|v| (k.as_str(), v))),
            ),
            _ => return None,
        };
        let outcome = entity.text_property("outcome")?.trim().to_lowercase();
        let observation = Observation {
            context,
            outcome,
            success: entity
                .property("success")
                .and_then(PropertyValue::as_bool)
                .unwrap_or(true),
            observed_at: entity.created_at,
        };
        observation.validate().ok().map(|_| observation)
    }
}

/// In-memory pattern cache; always recomputable from the log
#[derive(Debug, Clone)]
pub struct PatternEngine {
    config: LearningConfig,
    patterns: HashMap<(String, String), Pattern>,
}

impl PatternEngine {
    pub fn new(config: LearningConfig) -> Self {
        Self {
            config,
            patterns: HashMap::new(),
        }
    }

    /// Rebuild from observations, replayed in chronological order
    pub fn replay(config: LearningConfig, mut observations: Vec<Observation>) -> Self {
        observations.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
        let mut engine = Self::new(config);
        for observation in &observations {
            engine.observe(observation);
        }
        engine
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }

    /// Fold one observation into its pattern
    pub fn observe(&mut self, observation: &Observation) -> &Pattern {
        let signature = signature(&observation.context);
        let outcome = observation.outcome.clone();
        let prior = self.config.prior;
        let rate = self.config.learning_rate;
        let target = if observation.success { 1.0 } else { 0.0 };

        self.patterns
            .entry((signature.clone(), outcome.clone()))
            .and_modify(|p| {
                p.confidence = (p.confidence + rate * (target - p.confidence)).clamp(0.0, 1.0);
                p.support_count += 1;
                p.success_count += u64::from(observation.success);
                p.last_seen = p.last_seen.max(observation.observed_at);
            })
            .or_insert_with(|| Pattern {
                signature,
                context: observation.context.clone(),
                outcome,
                confidence: prior,
                support_count: 1,
                success_count: u64::from(observation.success),
                first_seen: observation.observed_at,
                last_seen: observation.observed_at,
            })
    }

    pub fn get(&self, context: &Context, outcome: &str) -> Option<&Pattern> {
        self.patterns.get(&(signature(context), outcome.to_string()))
    }

    /// Days past the stale horizon, zero while fresh
    fn stale_excess_days(&self, pattern: &Pattern, now: DateTime<Utc>) -> f64 {
        let age_days = (now - pattern.last_seen).num_seconds() as f64 / SECONDS_PER_DAY;
        (age_days - self.config.stale_horizon_days).max(0.0)
    }

    pub fn effective_confidence(&self, pattern: &Pattern, now: DateTime<Utc>) -> f64 {
        let excess = self.stale_excess_days(pattern, now);
        if excess <= 0.0 {
            return pattern.confidence;
        }
        let prior = self.config.prior;
        let factor = 0.5f64.powf(excess / self.config.decay_half_life_days);
        prior + (pattern.confidence - prior) * factor
    }

    pub fn state(&self, pattern: &Pattern, now: DateTime<Utc>) -> PatternState {
        if self.stale_excess_days(pattern, now) > 0.0 {
            PatternState::Stale
        } else if pattern.support_count > 1 {
            PatternState::Reinforced
        } else {
            PatternState::Observed
        }
    }

    pub fn view(&self, pattern: &Pattern, now: DateTime<Utc>) -> PatternView {
        PatternView {
            pattern: pattern.clone(),
            effective_confidence: self.effective_confidence(pattern, now),
            state: self.state(pattern, now),
        }
    }

    /// Patterns passing `filter`, by effective confidence desc, support desc,
    /// then signature and outcome.
    pub fn query(&self, filter: &PatternFilter, now: DateTime<Utc>) -> Vec<PatternView> {
        let wanted_context = normalize_context(filter.context.iter());
        let wanted_outcome = filter.outcome.as_ref().map(|o| o.trim().to_lowercase());

        let mut views: Vec<PatternView> = self
            .patterns
            .values()
            .filter(|p| {
                wanted_context
                    .iter()
                    .all(|(k, v)| p.context.get(k).map_or(false, |pv| pv == v))
            })
            .filter(|p| wanted_outcome.as_ref().map_or(true, |o| &p.outcome == o))
            .filter(|p| p.support_count >= filter.min_support)
            .map(|p| self.view(p, now))
            .filter(|v| v.effective_confidence >= filter.min_confidence)
            .collect();

        views.sort_by(|a, b| {
            b.effective_confidence
                .total_cmp(&a.effective_confidence)
                .then_with(|| b.pattern.support_count.cmp(&a.pattern.support_count))
                .then_with(|| a.pattern.signature.cmp(&b.pattern.signature))
                .then_with(|| a.pattern.outcome.cmp(&b.pattern.outcome))
        });
        views
    }

    /// Most specific pattern whose context is contained in `features`
    pub fn best_match(&self, features: &Context, now: DateTime<Utc>) -> Option<PatternView> {
        self.patterns
            .values()
            .filter(|p| p.matches(features))
            .map(|p| self.view(p, now))
            .min_by(|a, b| {
                b.pattern
                    .context
                    .len()
                    .cmp(&a.pattern.context.len())
                    .then_with(|| b.effective_confidence.total_cmp(&a.effective_confidence))
                    .then_with(|| b.pattern.support_count.cmp(&a.pattern.support_count))
                    .then_with(|| a.pattern.signature.cmp(&b.pattern.signature))
                    .then_with(|| a.pattern.outcome.cmp(&b.pattern.outcome))
            })
    }

    /// Blend the best matching pattern into a base recommendation.
    ///
    /// Confidence is the support-weighted mean of pattern and base. A pattern
    /// with a different outcome replaces the base only when its weighted
    /// evidence (support × confidence) is larger; otherwise the base is kept
    /// unchanged and the alternative is reported as an insight.
    pub fn improve(
        &self,
        features: &Context,
        base: &BaseRecommendation,
        now: DateTime<Utc>,
    ) -> ImprovedRecommendation {
        let unchanged = ImprovedRecommendation {
            recommendation: base.recommendation.clone(),
            confidence: base.confidence,
            insights: Vec::new(),
            pattern: None,
        };
        let Some(best) = self.best_match(features, now) else {
            return unchanged;
        };

        let pattern = &best.pattern;
        let s_p = pattern.support_count as f64;
        let c_p = best.effective_confidence;
        let s_b = base.support.unwrap_or(self.config.base_support).max(1) as f64;
        let c_b = base.confidence.clamp(0.0, 1.0);
        let blended = ((s_p * c_p + s_b * c_b) / (s_p + s_b)).clamp(0.0, 1.0);

        let evidence = format!(
            "{} of {} similar projects with {} succeeded with {}",
            pattern.success_count,
            pattern.support_count,
            pattern.signature,
            pattern.outcome
        );

        let same_outcome = pattern.outcome == base.recommendation.trim().to_lowercase();
        if same_outcome {
            return ImprovedRecommendation {
                recommendation: base.recommendation.clone(),
                confidence: blended,
                insights: vec![evidence],
                pattern: Some(pattern.signature.clone()),
            };
        }

        if s_p * c_p > s_b * c_b {
            ImprovedRecommendation {
                recommendation: pattern.outcome.clone(),
                confidence: blended,
                insights: vec![
                    evidence,
                    format!(
                        "Recommending {} instead of {} ({:.0}% confidence)",
                        pattern.outcome,
                        base.recommendation,
                        blended * 100.0
                    ),
                ],
                pattern: Some(pattern.signature.clone()),
            }
        } else {
            ImprovedRecommendation {
                insights: vec![format!("Alternative: {}", evidence)],
                pattern: Some(pattern.signature.clone()),
                ..unchanged
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ctx(pairs: &[(&str, &str)]) -> Context {
        normalize_context(pairs.iter().copied())
    }

    fn engine() -> PatternEngine {
        PatternEngine::new(LearningConfig::default())
    }

    #[test]
    fn test_signature_is_sorted() {
        let context = ctx(&[("Framework", " React "), ("language", "TypeScript"), ("empty", " ")]);
        assert_eq!(signature(&context), "framework=react ∧ language=typescript");
    }

    #[test]
    fn test_ema_updates() {
        let mut engine = engine();
        let context = ctx(&[("language", "go")]);
        let now = Utc::now();

        let first = engine.observe(&Observation::new(context.clone(), "hugo", true).at(now));
        assert_eq!(first.confidence, 0.5);
        assert_eq!(engine.state(engine.get(&context, "hugo").unwrap(), now), PatternState::Observed);

        let second = engine.observe(&Observation::new(context.clone(), "hugo", true).at(now)).clone();
        assert!((second.confidence - 0.6).abs() < 1e-9);
        assert_eq!(second.support_count, 2);
        assert_eq!(second.success_count, 2);
        assert_eq!(engine.state(&second, now), PatternState::Reinforced);

        let third = engine.observe(&Observation::new(context.clone(), "hugo", false).at(now));
        assert!((third.confidence - 0.48).abs() < 1e-9);
        assert_eq!(third.failure_count(), 1);
    }

    #[test]
    fn test_decay_after_horizon() {
        let mut engine = engine();
        let context = ctx(&[("language", "rust")]);
        let seen = Utc::now() - Duration::days(200);
        for _ in 0..5 {
            engine.observe(&Observation::new(context.clone(), "mdbook", true).at(seen));
        }
        let pattern = engine.get(&context, "mdbook").unwrap().clone();
        assert!(pattern.confidence > 0.7);

        // Still fresh right at the horizon
        let at_horizon = seen + Duration::days(90);
        assert_eq!(engine.effective_confidence(&pattern, at_horizon), pattern.confidence);

        // One half-life past the horizon
        let later = seen + Duration::days(120);
        let expected = 0.5 + (pattern.confidence - 0.5) * 0.5;
        assert!((engine.effective_confidence(&pattern, later) - expected).abs() < 1e-9);
        assert_eq!(engine.state(&pattern, later), PatternState::Stale);

        // Stored confidence is never rewritten
        assert_eq!(engine.get(&context, "mdbook").unwrap().confidence, pattern.confidence);
    }

    #[test]
    fn test_best_match_prefers_specific() {
        let mut engine = engine();
        let now = Utc::now();
        for _ in 0..3 {
            engine.observe(&Observation::new(ctx(&[("language", "js")]), "docusaurus", true).at(now));
        }
        engine.observe(
            &Observation::new(ctx(&[("language", "js"), ("framework", "vue")]), "vitepress", true).at(now),
        );

        let features = ctx(&[("language", "js"), ("framework", "vue"), ("extra", "x")]);
        let best = engine.best_match(&features, now).unwrap();
        assert_eq!(best.pattern.outcome, "vitepress");

        let features = ctx(&[("language", "js")]);
        assert_eq!(engine.best_match(&features, now).unwrap().pattern.outcome, "docusaurus");
        assert!(engine.best_match(&ctx(&[("language", "go")]), now).is_none());
    }

    #[test]
    fn test_improve_switches_on_dominant_evidence() {
        let mut engine = engine();
        let now = Utc::now();
        for _ in 0..4 {
            engine.observe(&Observation::new(ctx(&[("language", "go")]), "hugo", true).at(now));
        }

        let improved = engine.improve(
            &ctx(&[("language", "go")]),
            &BaseRecommendation::new("mkdocs", 0.6),
            now,
        );
        assert_eq!(improved.recommendation, "hugo");
        assert!(improved.confidence > 0.6);
        assert_eq!(improved.insights[0], "4 of 4 similar projects with language=go succeeded with hugo");
        assert_eq!(improved.pattern.as_deref(), Some("language=go"));
    }

    #[test]
    fn test_improve_without_match_is_unchanged() {
        let engine = engine();
        let base = BaseRecommendation::new("mkdocs", 0.6);
        let improved = engine.improve(&ctx(&[("language", "go")]), &base, Utc::now());
        assert_eq!(improved.recommendation, "mkdocs");
        assert_eq!(improved.confidence, 0.6);
        assert!(improved.insights.is_empty());
        assert!(improved.pattern.is_none());
    }

    #[test]
    fn test_weak_alternative_keeps_base() {
        let mut engine = engine();
        let now = Utc::now();
        engine.observe(&Observation::new(ctx(&[("language", "go")]), "hugo", false).at(now));

        let base = BaseRecommendation {
            recommendation: "mkdocs".to_string(),
            confidence: 0.9,
            support: Some(3),
        };
        let improved = engine.improve(&ctx(&[("language", "go")]), &base, now);
        assert_eq!(improved.recommendation, "mkdocs");
        assert_eq!(improved.confidence, 0.9);
        assert!(improved.insights[0].starts_with("Alternative:"));
    }

    #[test]
    fn test_query_filters() {
        let mut engine = engine();
        let now = Utc::now();
        engine.observe(&Observation::new(ctx(&[("language", "go")]), "hugo", true).at(now));
        engine.observe(&Observation::new(ctx(&[("language", "go")]), "hugo", true).at(now));
        engine.observe(&Observation::new(ctx(&[("language", "python")]), "mkdocs", true).at(now));

        let all = engine.query(&PatternFilter::default(), now);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].pattern.outcome, "hugo");

        let filter = PatternFilter {
            context: ctx(&[("language", "Python")]),
            ..PatternFilter::default()
        };
        assert_eq!(engine.query(&filter, now)[0].pattern.outcome, "mkdocs");

        let filter = PatternFilter {
            min_support: 2,
            ..PatternFilter::default()
        };
        assert_eq!(engine.query(&filter, now).len(), 1);
    }

    #[test]
    fn test_observation_entity_round_trip() {
        let observation = Observation::new(ctx(&[("language", "go")]), "hugo", false);
        let entity = observation.to_entity("obs-1");
        assert_eq!(entity.kind, EntityKind::Observation);
        assert_eq!(Observation::from_entity(&entity), Some(observation));

        let project = Entity::new("p", EntityKind::Project);
        assert!(Observation::from_entity(&project).is_none());
    }
}
