use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::algorithms;
use crate::error::{LibError, Result};
use crate::models::{CaseId, Element, ElementId, ElementKind, EvidenceLink, MoveTarget};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaseInvariantViolation {
    InvalidRootCount {
        root_count: usize,
    },
    UnknownParent {
        element_id: ElementId,
        parent_id: ElementId,
    },
    ForeignParent {
        element_id: ElementId,
        parent_id: ElementId,
    },
    SandboxedParent {
        element_id: ElementId,
        parent_id: ElementId,
    },
    EvidenceWithChildren {
        evidence_id: ElementId,
    },
    InvalidPlacement {
        element_id: ElementId,
        parent_kind: ElementKind,
    },
    LinkToNonClaim {
        evidence_id: ElementId,
        target_id: ElementId,
    },
    CycleDetected,
}

impl CaseInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            CaseInvariantViolation::InvalidRootCount { .. } => "case_root_count",
            CaseInvariantViolation::UnknownParent { .. } => "case_unknown_parent",
            CaseInvariantViolation::ForeignParent { .. } => "case_foreign_parent",
            CaseInvariantViolation::SandboxedParent { .. } => "case_sandboxed_parent",
            CaseInvariantViolation::EvidenceWithChildren { .. } => "case_evidence_children",
            CaseInvariantViolation::InvalidPlacement { .. } => "case_invalid_placement",
            CaseInvariantViolation::LinkToNonClaim { .. } => "case_invalid_evidence_link",
            CaseInvariantViolation::CycleDetected => "case_cycle",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            CaseInvariantViolation::InvalidRootCount { .. } => {
                "A case must have exactly one root goal"
            }
            CaseInvariantViolation::UnknownParent { .. } => "Parent element does not exist",
            CaseInvariantViolation::ForeignParent { .. } => {
                "Parent element belongs to another case"
            }
            CaseInvariantViolation::SandboxedParent { .. } => {
                "Parent element is detached from the argument"
            }
            CaseInvariantViolation::EvidenceWithChildren { .. } => {
                "Evidence cannot have child elements"
            }
            CaseInvariantViolation::InvalidPlacement { .. } => {
                "Element kind cannot be placed under this parent"
            }
            CaseInvariantViolation::LinkToNonClaim { .. } => {
                "Evidence can only support property claims"
            }
            CaseInvariantViolation::CycleDetected => "Argument structure must be acyclic",
        }
    }
}

/// Which parent kinds each element kind may sit under. `None` means the kind is
/// never a structural child (goal roots, evidence).
pub const fn allowed_parent_kinds(kind: ElementKind) -> Option<&'static [ElementKind]> {
    match kind {
        ElementKind::Goal | ElementKind::Evidence => None,
        ElementKind::Strategy | ElementKind::Context => Some(&[ElementKind::Goal]),
        ElementKind::PropertyClaim => Some(&[
            ElementKind::Goal,
            ElementKind::Strategy,
            ElementKind::PropertyClaim,
        ]),
    }
}

pub fn placement_allowed(kind: ElementKind, target: MoveTarget) -> bool {
    match kind {
        ElementKind::Evidence => matches!(target, MoveTarget::PropertyClaim(_)),
        _ => allowed_parent_kinds(kind).is_some_and(|kinds| kinds.contains(&target.kind())),
    }
}

pub fn case_invariant_violations(
    case_id: CaseId,
    elements: &[Element],
    links: &[EvidenceLink],
) -> Vec<CaseInvariantViolation> {
    let by_id: HashMap<ElementId, &Element> =
        elements.iter().map(|element| (element.id, element)).collect();
    let mut violations = Vec::new();

    let root_count = elements.iter().filter(|element| element.is_root_goal()).count();
    if root_count != 1 {
        violations.push(CaseInvariantViolation::InvalidRootCount { root_count });
    }

    for element in elements {
        if element.in_sandbox {
            continue;
        }
        let Some(parent_id) = element.parent_id else {
            continue;
        };
        let Some(parent) = by_id.get(&parent_id) else {
            violations.push(CaseInvariantViolation::UnknownParent {
                element_id: element.id,
                parent_id,
            });
            continue;
        };
        if parent.case_id != case_id || element.case_id != case_id {
            violations.push(CaseInvariantViolation::ForeignParent {
                element_id: element.id,
                parent_id,
            });
        }
        if parent.in_sandbox {
            violations.push(CaseInvariantViolation::SandboxedParent {
                element_id: element.id,
                parent_id,
            });
        }
        if parent.kind == ElementKind::Evidence {
            violations.push(CaseInvariantViolation::EvidenceWithChildren {
                evidence_id: parent.id,
            });
        } else if allowed_parent_kinds(element.kind)
            .is_none_or(|kinds| !kinds.contains(&parent.kind))
        {
            violations.push(CaseInvariantViolation::InvalidPlacement {
                element_id: element.id,
                parent_kind: parent.kind,
            });
        }
    }

    for link in links {
        match by_id.get(&link.property_claim_id) {
            Some(target) if target.kind == ElementKind::PropertyClaim => {}
            _ => violations.push(CaseInvariantViolation::LinkToNonClaim {
                evidence_id: link.evidence_id,
                target_id: link.property_claim_id,
            }),
        }
    }

    if algorithms::has_cycle(elements) {
        violations.push(CaseInvariantViolation::CycleDetected);
    }

    violations
}

pub fn ensure_case_invariants(
    case_id: CaseId,
    elements: &[Element],
    links: &[EvidenceLink],
) -> Result<()> {
    let violations = case_invariant_violations(case_id, elements, links);
    if let Some(first) = violations.first() {
        return Err(LibError::conflict_with_code(
            first.error_code(),
            first.public_message(),
            anyhow!(
                "case {} invariant validation failed: {:?}",
                case_id,
                violations
            ),
        ));
    }

    Ok(())
}

/// Visibility an element must take when it lands under `destination`: the same as
/// the first sibling already there (structural children first, then linked evidence),
/// or visible when it has no siblings.
pub fn sibling_hidden(
    elements: &[Element],
    links: &[EvidenceLink],
    destination: ElementId,
    moving: ElementId,
) -> bool {
    let by_id: HashMap<ElementId, &Element> =
        elements.iter().map(|element| (element.id, element)).collect();

    let structural = elements.iter().filter(|element| {
        element.id != moving
            && !element.in_sandbox
            && element.is_structural()
            && element.parent_id == Some(destination)
    });

    let mut seen = HashSet::new();
    let evidence = links
        .iter()
        .filter(|link| link.property_claim_id == destination && link.evidence_id != moving)
        .filter(|link| seen.insert(link.evidence_id))
        .filter_map(|link| by_id.get(&link.evidence_id).copied())
        .filter(|element| !element.in_sandbox);

    structural
        .chain(evidence)
        .next()
        .map(|sibling| sibling.hidden)
        .unwrap_or(false)
}
