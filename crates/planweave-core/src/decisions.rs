//! Orchestrator-owned decision selections.
//!
//! Steps may only propose options and a recommendation. Selections are
//! written here, as orchestrator patches, so they pass the merge engine's
//! ownership check.

use scenario_state::{DecisionKey, ScenarioState, SelectionSource};
use serde_json::{json, Value};
use state_merge::Patch;

use crate::error::{OrchestratorError, OrchestratorResult};

fn selection_patches(key: DecisionKey, option: Option<&str>, source: Option<SelectionSource>) -> [Patch; 2] {
    let source = source.map_or(Value::Null, |s| json!(s));
    [
        Patch::replace(format!("/decisions/{key}/selected_option_id"), json!(option)),
        Patch::replace(format!("/decisions/{key}/selection_source"), source),
    ]
}

/// Patches that bring every selection in line with the auto-select policy.
///
/// - no selection: take the recommendation
/// - stale selection: take the recommendation, or clear it if there is none
/// - auto selection differing from the recommendation: follow it
/// - user selection that is still offered: keep it
pub fn reconcile_selections(state: &ScenarioState) -> Vec<Patch> {
    let mut patches = Vec::new();
    for (key, decision) in &state.decisions {
        let recommended = decision.recommended_option_id.as_deref();
        let current = decision.selected_option_id.as_deref();

        let target = if decision.selection_is_stale() {
            Some(recommended)
        } else {
            match (current, decision.selection_source) {
                (None, _) => recommended.map(Some),
                (Some(_), Some(SelectionSource::User)) => None,
                (Some(cur), _) => recommended.filter(|rec| *rec != cur).map(Some),
            }
        };

        if let Some(option) = target {
            let source = option.map(|_| SelectionSource::Auto);
            patches.extend(selection_patches(*key, option, source));
        }
    }
    patches
}

/// Patches recording an explicit user choice.
pub fn user_selection_patches(
    state: &ScenarioState,
    key: DecisionKey,
    option: &str,
) -> OrchestratorResult<Vec<Patch>> {
    let offered = state.decision(key).is_some_and(|d| d.has_option(option));
    if !offered {
        return Err(OrchestratorError::UnknownOption {
            decision: key.to_string(),
            option: option.to_string(),
        });
    }
    Ok(selection_patches(key, Some(option), Some(SelectionSource::User)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenario_state::DecisionOption;
    use state_merge::{MergeEngine, TaggedOutput};

    fn with_pricing(selected: Option<&str>, source: Option<SelectionSource>, rec: Option<&str>) -> ScenarioState {
        let mut state = ScenarioState::blank("s", "S");
        let pricing = state.decisions.entry(DecisionKey::Pricing).or_default();
        pricing.options = vec![
            DecisionOption::new("tiered", "Tiered"),
            DecisionOption::new("usage", "Usage based"),
        ];
        pricing.recommended_option_id = rec.map(str::to_string);
        pricing.selected_option_id = selected.map(str::to_string);
        pricing.selection_source = source;
        state
    }

    fn apply(state: &ScenarioState) -> ScenarioState {
        let patches = reconcile_selections(state);
        MergeEngine::default()
            .merge(state, &[TaggedOutput::orchestrator(patches)])
            .unwrap()
            .state
    }

    #[test]
    fn test_empty_selection_takes_recommendation() {
        let merged = apply(&with_pricing(None, None, Some("usage")));
        let pricing = merged.decision(DecisionKey::Pricing).unwrap();
        assert_eq!(pricing.selected_option_id.as_deref(), Some("usage"));
        assert_eq!(pricing.selection_source, Some(SelectionSource::Auto));
    }

    #[test]
    fn test_auto_selection_follows_recommendation() {
        let state = with_pricing(Some("tiered"), Some(SelectionSource::Auto), Some("usage"));
        assert_eq!(apply(&state).selection(DecisionKey::Pricing), Some("usage"));
    }

    #[test]
    fn test_user_selection_is_sticky() {
        let state = with_pricing(Some("tiered"), Some(SelectionSource::User), Some("usage"));
        assert!(reconcile_selections(&state).is_empty());
    }

    #[test]
    fn test_stale_user_selection_is_replaced() {
        let state = with_pricing(Some("flat"), Some(SelectionSource::User), Some("usage"));
        let merged = apply(&state);
        let pricing = merged.decision(DecisionKey::Pricing).unwrap();
        assert_eq!(pricing.selected_option_id.as_deref(), Some("usage"));
        assert_eq!(pricing.selection_source, Some(SelectionSource::Auto));
    }

    #[test]
    fn test_stale_selection_without_recommendation_is_cleared() {
        let state = with_pricing(Some("flat"), Some(SelectionSource::Auto), None);
        let merged = apply(&state);
        let pricing = merged.decision(DecisionKey::Pricing).unwrap();
        assert_eq!(pricing.selected_option_id, None);
        assert_eq!(pricing.selection_source, None);
    }

    #[test]
    fn test_settled_state_needs_no_patches() {
        let state = with_pricing(Some("usage"), Some(SelectionSource::Auto), Some("usage"));
        assert!(reconcile_selections(&state).is_empty());
        assert!(reconcile_selections(&ScenarioState::blank("s", "S")).is_empty());
    }

    #[test]
    fn test_user_selection_requires_offered_option() {
        let state = with_pricing(None, None, Some("usage"));
        assert!(matches!(
            user_selection_patches(&state, DecisionKey::Pricing, "flat"),
            Err(OrchestratorError::UnknownOption { .. })
        ));
        let patches = user_selection_patches(&state, DecisionKey::Pricing, "tiered").unwrap();
        let merged = MergeEngine::default()
            .merge(&state, &[TaggedOutput::orchestrator(patches)])
            .unwrap()
            .state;
        let pricing = merged.decision(DecisionKey::Pricing).unwrap();
        assert_eq!(pricing.selected_option_id.as_deref(), Some("tiered"));
        assert_eq!(pricing.selection_source, Some(SelectionSource::User));
    }
}
