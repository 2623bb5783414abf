//! Cross-pillar consistency rules.
//!
//! Each [`CrossCheck`] is a pure function of the scenario. The rule set is
//! picked from a [`ScenarioProfile`]: category, compliance level, team size
//! and the business pattern detected from the idea text.
//!
//! A rule whose inputs are not there yet passes; rules only judge content
//! that has been generated.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use scenario_state::{ComplianceLevel, DecisionKey, PillarHealth, ScenarioState, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::PipelineCatalog;

static MARKETPLACE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(marketplace|two[- ]sided|buyers and sellers|hosts and guests|supply and demand sides)\b")
        .expect("marketplace pattern is a valid regex")
});

/// Categories that always carry regulatory review.
const REGULATED_CATEGORIES: [&str; 4] = ["fintech", "healthtech", "healthcare", "insurance"];

/// Team size at or below which scope is checked against capacity.
const SMALL_TEAM: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessPattern {
    Standard,
    Marketplace,
}

/// Inputs that decide which rules apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioProfile {
    pub category: String,
    pub compliance_level: ComplianceLevel,
    pub team_size: u32,
    pub pattern: BusinessPattern,
}

impl ScenarioProfile {
    pub fn detect(state: &ScenarioState) -> Self {
        let mut text = String::new();
        collect_text(&state.idea, &mut text);
        let marketplace = state.meta.category.eq_ignore_ascii_case("marketplace")
            || MARKETPLACE_PATTERN.is_match(&text);

        Self {
            category: state.meta.category.to_ascii_lowercase(),
            compliance_level: state.meta.compliance_level,
            team_size: state.meta.team_size,
            pattern: if marketplace {
                BusinessPattern::Marketplace
            } else {
                BusinessPattern::Standard
            },
        }
    }

    pub fn is_regulated(&self) -> bool {
        self.compliance_level == ComplianceLevel::High
            || REGULATED_CATEGORIES.contains(&self.category.as_str())
    }
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push_str(s);
            out.push('\n');
        }
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, out)),
        _ => {}
    }
}

/// A single cross-pillar rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossCheck {
    /// Selected pricing targets the same segment as the selected ICP.
    PricingMatchesIcp,
    /// Selected channel and sales motion agree on the motion.
    ChannelMatchesSalesMotion,
    /// Every decision with options has a selection.
    DecisionsSelected,
    /// A generated market pillar is backed by at least one source.
    EvidenceBacksMarket,
    /// Regulated scenarios carry an operations compliance plan.
    ComplianceCovered,
    /// Small teams do not take on a large MVP.
    TeamCapacityFitsScope,
    /// Marketplaces describe how they seed both sides.
    MarketplaceLiquidity,
}

impl CrossCheck {
    pub fn id(self) -> &'static str {
        match self {
            Self::PricingMatchesIcp => "pricing_matches_icp",
            Self::ChannelMatchesSalesMotion => "channel_matches_sales_motion",
            Self::DecisionsSelected => "decisions_selected",
            Self::EvidenceBacksMarket => "evidence_backs_market",
            Self::ComplianceCovered => "compliance_covered",
            Self::TeamCapacityFitsScope => "team_capacity_fits_scope",
            Self::MarketplaceLiquidity => "marketplace_liquidity",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::PricingMatchesIcp
            | Self::ChannelMatchesSalesMotion
            | Self::ComplianceCovered
            | Self::MarketplaceLiquidity => Severity::High,
            Self::DecisionsSelected | Self::EvidenceBacksMarket | Self::TeamCapacityFitsScope => {
                Severity::Medium
            }
        }
    }

    fn pillar(self) -> &'static str {
        match self {
            Self::PricingMatchesIcp => "offer",
            Self::ChannelMatchesSalesMotion | Self::MarketplaceLiquidity => "go_to_market",
            Self::DecisionsSelected => "customer",
            Self::EvidenceBacksMarket => "market",
            Self::ComplianceCovered | Self::TeamCapacityFitsScope => "operations",
        }
    }

    /// Steps a failure points at directly. `None` means the fix needs
    /// arbitration.
    fn affected_steps(self) -> Option<Vec<String>> {
        let steps: &[&str] = match self {
            Self::PricingMatchesIcp => &["pricing_analyst"],
            Self::ChannelMatchesSalesMotion => &["sales_motion_planner"],
            Self::EvidenceBacksMarket => &["market_research"],
            Self::MarketplaceLiquidity => &["channel_planner"],
            Self::DecisionsSelected | Self::ComplianceCovered | Self::TeamCapacityFitsScope => {
                return None
            }
        };
        Some(steps.iter().map(|s| s.to_string()).collect())
    }

    /// `Some(message)` on failure.
    fn check(self, state: &ScenarioState, catalog: &PipelineCatalog) -> Option<(String, Option<String>)> {
        match self {
            Self::PricingMatchesIcp => {
                let pricing = selected_attr(state, DecisionKey::Pricing, "segment")?;
                let icp = selected_attr(state, DecisionKey::Icp, "segment")?;
                (pricing != icp).then(|| {
                    (format!("pricing targets the {pricing} segment but the ICP is {icp}"), None)
                })
            }
            Self::ChannelMatchesSalesMotion => {
                let channel = selected_attr(state, DecisionKey::Channel, "motion")?;
                let motion = selected_attr(state, DecisionKey::SalesMotion, "motion")?;
                (channel != motion).then(|| {
                    (format!("channel assumes a {channel} motion but sales motion is {motion}"), None)
                })
            }
            Self::DecisionsSelected => {
                let open: Vec<DecisionKey> = state
                    .decisions
                    .iter()
                    .filter(|(_, d)| !d.options.is_empty() && d.selected_option_id.is_none())
                    .map(|(k, _)| *k)
                    .collect();
                let first = open.first()?;
                let names: Vec<&str> = open.iter().map(|k| k.as_str()).collect();
                Some((
                    format!("decisions without a selection: {}", names.join(", ")),
                    catalog.owner_of(*first).map(str::to_string),
                ))
            }
            Self::EvidenceBacksMarket => {
                let market = state.pillars.get("market")?;
                (!market.summary.is_empty() && state.evidence.sources.is_empty())
                    .then(|| ("market pillar cites no evidence sources".to_string(), None))
            }
            Self::ComplianceCovered => {
                let operations = state.pillars.get("operations")?;
                (!has_field(&operations.fields, "compliance_plan"))
                    .then(|| ("regulated scenario has no compliance plan in operations".to_string(), None))
            }
            Self::TeamCapacityFitsScope => {
                let effort = selected_attr(state, DecisionKey::MvpScope, "effort")?;
                (state.meta.team_size <= SMALL_TEAM && effort == "large").then(|| {
                    (
                        format!(
                            "team capacity: a team of {} cannot deliver a large MVP scope",
                            state.meta.team_size
                        ),
                        None,
                    )
                })
            }
            Self::MarketplaceLiquidity => {
                let gtm = state.pillars.get("go_to_market")?;
                (!has_field(&gtm.fields, "liquidity_strategy"))
                    .then(|| ("marketplace go-to-market has no liquidity strategy".to_string(), None))
            }
        }
    }

    pub fn evaluate(self, state: &ScenarioState, catalog: &PipelineCatalog) -> RuleResult {
        match self.check(state, catalog) {
            None => RuleResult {
                rule: self.id().to_string(),
                passed: true,
                severity: self.severity(),
                message: String::new(),
                pillar: self.pillar().to_string(),
                affected_steps: None,
            },
            Some((message, pillar)) => RuleResult {
                rule: self.id().to_string(),
                passed: false,
                severity: self.severity(),
                message,
                pillar: pillar.unwrap_or_else(|| self.pillar().to_string()),
                affected_steps: self.affected_steps(),
            },
        }
    }
}

fn selected_attr<'s>(state: &'s ScenarioState, key: DecisionKey, attr: &str) -> Option<&'s str> {
    state.decision(key)?.selected_option()?.attribute(attr)
}

fn has_field(fields: &serde_json::Map<String, Value>, key: &str) -> bool {
    fields.get(key).is_some_and(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}

/// Verdict of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: String,
    pub passed: bool,
    pub severity: Severity,
    pub message: String,
    pub pillar: String,
    /// Direct rerun targets; `None` on a failure means arbitration.
    #[serde(default)]
    pub affected_steps: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<CrossCheck>,
}

impl RuleSet {
    /// Rules every scenario gets.
    pub fn base() -> Self {
        Self {
            rules: vec![
                CrossCheck::PricingMatchesIcp,
                CrossCheck::ChannelMatchesSalesMotion,
                CrossCheck::DecisionsSelected,
                CrossCheck::EvidenceBacksMarket,
            ],
        }
    }

    pub fn for_profile(profile: &ScenarioProfile) -> Self {
        let mut set = Self::base();
        if profile.is_regulated() {
            set = set.with_rule(CrossCheck::ComplianceCovered);
        }
        if profile.team_size <= SMALL_TEAM {
            set = set.with_rule(CrossCheck::TeamCapacityFitsScope);
        }
        if profile.pattern == BusinessPattern::Marketplace {
            set = set.with_rule(CrossCheck::MarketplaceLiquidity);
        }
        set
    }

    pub fn with_rule(mut self, rule: CrossCheck) -> Self {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
        self
    }

    pub fn evaluate(&self, state: &ScenarioState, catalog: &PipelineCatalog) -> Vec<RuleResult> {
        self.rules.iter().map(|r| r.evaluate(state, catalog)).collect()
    }
}

/// Pass/fail tally per pillar.
pub fn pillar_health(results: &[RuleResult]) -> BTreeMap<String, PillarHealth> {
    let mut health: BTreeMap<String, PillarHealth> = BTreeMap::new();
    for result in results {
        let entry = health.entry(result.pillar.clone()).or_default();
        if result.passed {
            entry.passed += 1;
        } else {
            entry.failed += 1;
        }
    }
    for entry in health.values_mut() {
        entry.score = f64::from(entry.passed) / f64::from(entry.passed + entry.failed);
    }
    health
}
