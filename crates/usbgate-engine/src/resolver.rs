// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Assignment resolution
//!
//! Given one newly visible device and the entitlement rules of all running
//! frontends, pick at most one winning rule. Per frontend only the most
//! specific matching rule is retained; across frontends the highest
//! specificity ranks first, and any multi-frontend conflict goes through the
//! interactive confirmation service, whose response selects the final
//! winner (or none).

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::io::{AttachmentPrompt, ConfirmRequest, DomainRegistry};
use usbgate_types::{Assignment, AssignmentMode, Device, DeviceId, PortId, VmName};

/// The most specific rule in `assignments` matching the device, if any.
///
/// Equal-specificity ties between rules of the same frontend are broken by
/// selector order so repeated evaluations agree.
pub fn best_match<'a>(
    assignments: &'a [Assignment],
    backend: &VmName,
    port: &PortId,
    device_id: Option<&DeviceId>,
) -> Option<&'a Assignment> {
    let mut best: Option<&Assignment> = None;
    for rule in assignments {
        if !rule.selector.matches(backend, port, device_id) {
            continue;
        }
        best = match best {
            Some(current) if !rule.shadows(current) => Some(current),
            _ => Some(rule),
        };
    }
    best
}

/// Per-frontend candidate set for one device: each running frontend's best
/// matching rule.
pub fn collect_candidates(
    registry: &dyn DomainRegistry,
    backend: &VmName,
    port: &PortId,
    device_id: Option<&DeviceId>,
) -> BTreeMap<VmName, Assignment> {
    let mut candidates = BTreeMap::new();
    for frontend in registry.running_domains() {
        let rules = registry.assignments(&frontend);
        if let Some(rule) = best_match(&rules, backend, port, device_id) {
            candidates.insert(frontend, rule.clone());
        }
    }
    candidates
}

/// Candidates ordered by precedence: specificity first, then frontend name
/// for a stable order.
pub fn rank_candidates(
    candidates: &BTreeMap<VmName, Assignment>,
) -> Vec<(&VmName, &Assignment)> {
    let mut ranked: Vec<_> = candidates.iter().collect();
    ranked.sort_by(|(name_a, rule_a), (name_b, rule_b)| {
        rule_b
            .selector
            .specificity()
            .cmp(&rule_a.selector.specificity())
            .then_with(|| name_a.cmp(name_b))
    });
    ranked
}

/// Resolve the winning assignment for `device`, consulting the confirmation
/// service where required. `None` means no automatic action is taken.
pub async fn resolve(
    prompt: &dyn AttachmentPrompt,
    device: &Device,
    description: &str,
    mut candidates: BTreeMap<VmName, Assignment>,
) -> Option<Assignment> {
    if candidates.is_empty() {
        return None;
    }

    let (frontend, assignment, confirmed) = if candidates.len() == 1 {
        let (frontend, assignment) = candidates.pop_first().expect("one candidate");
        (frontend, assignment, false)
    } else {
        let ranked: Vec<VmName> = rank_candidates(&candidates)
            .into_iter()
            .map(|(name, _)| name.clone())
            .collect();
        let default_target = ranked.first().cloned();
        let request = ConfirmRequest {
            backend: device.backend().clone(),
            port: device.port().clone(),
            description: description.to_string(),
            candidates: ranked,
            default_target,
        };
        let Some(chosen) = prompt.confirm(request).await else {
            debug!(operation = "resolve", device = %device, "Confirmation selected no frontend");
            return None;
        };
        // the response must name one of the candidates
        let Some(assignment) = candidates.remove(&chosen) else {
            debug!(operation = "resolve", device = %device, chosen = %chosen, "Confirmation named a non-candidate");
            return None;
        };
        info!(operation = "resolve", device = %device, frontend = %chosen, "Conflict resolved by confirmation");
        (chosen, assignment, true)
    };

    match assignment.mode {
        AssignmentMode::Manual => {
            debug!(operation = "resolve", device = %device, frontend = %frontend, "Manual rule permits but does not trigger attachment");
            None
        }
        AssignmentMode::AskToAttach if !confirmed => {
            let request = ConfirmRequest {
                backend: device.backend().clone(),
                port: device.port().clone(),
                description: description.to_string(),
                candidates: vec![frontend.clone()],
                default_target: Some(frontend.clone()),
            };
            match prompt.confirm(request).await {
                Some(chosen) if chosen == frontend => Some(assignment),
                _ => {
                    debug!(operation = "resolve", device = %device, frontend = %frontend, "Attachment declined");
                    None
                }
            }
        }
        _ => Some(assignment),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPrompt;
    use std::collections::BTreeMap as Map;
    use usbgate_types::{DeviceSelector, Pattern};

    fn vm(name: &str) -> VmName {
        VmName::new(name).unwrap()
    }

    fn port(p: &str) -> PortId {
        PortId::new(p).unwrap()
    }

    fn rule(frontend: &str, port: &str, id: &str, mode: AssignmentMode) -> Assignment {
        Assignment {
            frontend: vm(frontend),
            selector: DeviceSelector {
                backend: Pattern::Any,
                port: Pattern::from(port.to_string()),
                device_id: Pattern::from(id.to_string()),
            },
            mode,
            options: Map::new(),
        }
    }

    fn device() -> Device {
        Device::new(vm("sys-usb"), port("1-1"))
    }

    fn id(s: &str) -> DeviceId {
        DeviceId(s.to_string())
    }

    #[test]
    fn test_best_match_prefers_most_specific_rule() {
        let rules = vec![
            rule("work", "*", "*", AssignmentMode::AutoAttach),
            rule("work", "1-1", "X", AssignmentMode::AutoAttach),
            rule("work", "1-1", "*", AssignmentMode::AutoAttach),
        ];
        let best = best_match(&rules, &vm("sys-usb"), &port("1-1"), Some(&id("X"))).unwrap();
        assert_eq!(best.selector.port, Pattern::Exact("1-1".to_string()));
        assert_eq!(best.selector.device_id, Pattern::Exact("X".to_string()));
    }

    #[test]
    fn test_best_match_none_when_nothing_matches() {
        let rules = vec![rule("work", "2-1", "*", AssignmentMode::AutoAttach)];
        assert!(best_match(&rules, &vm("sys-usb"), &port("1-1"), None).is_none());
    }

    #[test]
    fn test_ranking_picks_exact_exact_frontend_first() {
        let mut candidates = Map::new();
        candidates.insert(vm("f1"), rule("f1", "1-1", "X", AssignmentMode::AutoAttach));
        candidates.insert(vm("f2"), rule("f2", "1-1", "*", AssignmentMode::AutoAttach));
        candidates.insert(vm("f3"), rule("f3", "*", "X", AssignmentMode::AutoAttach));
        let ranked = rank_candidates(&candidates);
        assert_eq!(ranked[0].0, &vm("f1"));
    }

    #[test]
    fn test_ranking_port_exact_beats_device_exact() {
        let mut candidates = Map::new();
        candidates.insert(vm("f1"), rule("f1", "1-1", "*", AssignmentMode::AutoAttach));
        candidates.insert(vm("f2"), rule("f2", "*", "X", AssignmentMode::AutoAttach));
        let ranked = rank_candidates(&candidates);
        assert_eq!(ranked[0].0, &vm("f1"));
    }

    #[tokio::test]
    async fn test_single_auto_attach_candidate_wins_without_prompt() {
        let prompt = ScriptedPrompt::new();
        let mut candidates = Map::new();
        candidates.insert(vm("work"), rule("work", "1-1", "*", AssignmentMode::AutoAttach));

        let winner = resolve(&prompt, &device(), "stick", candidates).await;
        assert_eq!(winner.unwrap().frontend, vm("work"));
        assert!(prompt.requests().is_empty());
    }

    #[tokio::test]
    async fn test_manual_rule_never_triggers() {
        let prompt = ScriptedPrompt::new();
        let mut candidates = Map::new();
        candidates.insert(vm("work"), rule("work", "1-1", "*", AssignmentMode::Manual));

        assert!(resolve(&prompt, &device(), "stick", candidates).await.is_none());
        assert!(prompt.requests().is_empty());
    }

    #[tokio::test]
    async fn test_ask_to_attach_prompts_even_single_candidate() {
        let prompt = ScriptedPrompt::new();
        prompt.push_response(Some(vm("work")));
        let mut candidates = Map::new();
        candidates.insert(vm("work"), rule("work", "1-1", "*", AssignmentMode::AskToAttach));

        let winner = resolve(&prompt, &device(), "stick", candidates).await;
        assert_eq!(winner.unwrap().frontend, vm("work"));

        let requests = prompt.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].candidates, vec![vm("work")]);
        assert_eq!(requests[0].default_target, Some(vm("work")));
    }

    #[tokio::test]
    async fn test_ask_to_attach_declined() {
        let prompt = ScriptedPrompt::new();
        prompt.push_response(None);
        let mut candidates = Map::new();
        candidates.insert(vm("work"), rule("work", "1-1", "*", AssignmentMode::AskToAttach));

        assert!(resolve(&prompt, &device(), "stick", candidates).await.is_none());
    }

    #[tokio::test]
    async fn test_conflict_resolved_by_confirmation() {
        let prompt = ScriptedPrompt::new();
        prompt.push_response(Some(vm("f2")));
        let mut candidates = Map::new();
        candidates.insert(vm("f1"), rule("f1", "1-1", "*", AssignmentMode::AutoAttach));
        candidates.insert(vm("f2"), rule("f2", "*", "X", AssignmentMode::AutoAttach));

        let winner = resolve(&prompt, &device(), "stick", candidates).await;
        assert_eq!(winner.unwrap().frontend, vm("f2"));

        let requests = prompt.requests();
        assert_eq!(requests.len(), 1);
        // port-exact rule ranks first and is offered as the default
        assert_eq!(requests[0].candidates, vec![vm("f1"), vm("f2")]);
        assert_eq!(requests[0].default_target, Some(vm("f1")));
    }

    #[tokio::test]
    async fn test_conflict_winner_already_confirmed_is_not_asked_again() {
        let prompt = ScriptedPrompt::new();
        prompt.push_response(Some(vm("f2")));
        let mut candidates = Map::new();
        candidates.insert(vm("f1"), rule("f1", "1-1", "*", AssignmentMode::AutoAttach));
        candidates.insert(vm("f2"), rule("f2", "*", "X", AssignmentMode::AskToAttach));

        let winner = resolve(&prompt, &device(), "stick", candidates).await;
        assert_eq!(winner.unwrap().frontend, vm("f2"));
        assert_eq!(prompt.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_naming_non_candidate_is_rejected() {
        let prompt = ScriptedPrompt::new();
        prompt.push_response(Some(vm("intruder")));
        let mut candidates = Map::new();
        candidates.insert(vm("f1"), rule("f1", "1-1", "*", AssignmentMode::AutoAttach));
        candidates.insert(vm("f2"), rule("f2", "*", "X", AssignmentMode::AutoAttach));

        assert!(resolve(&prompt, &device(), "stick", candidates).await.is_none());
    }

    #[tokio::test]
    async fn test_conflict_winner_with_manual_rule_is_not_attached() {
        let prompt = ScriptedPrompt::new();
        prompt.push_response(Some(vm("f2")));
        let mut candidates = Map::new();
        candidates.insert(vm("f1"), rule("f1", "1-1", "*", AssignmentMode::AutoAttach));
        candidates.insert(vm("f2"), rule("f2", "*", "X", AssignmentMode::Manual));

        assert!(resolve(&prompt, &device(), "stick", candidates).await.is_none());
    }
}
