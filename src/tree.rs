//! Rebuilds the nested argument tree from flat element rows.
//!
//! Structural children come from `parent_id`; evidence hangs off claims through
//! [`EvidenceLink`]s and is appended after a claim's structural children. Detached
//! (sandboxed) elements never appear in the tree.

use std::collections::{HashMap, HashSet};

use crate::error::{LibError, Result};
use crate::models::{Element, ElementId, ElementKind, EvidenceLink, TreeNode};

#[derive(Debug, Clone, PartialEq)]
pub struct CaseTree {
    pub root: TreeNode,
    /// Set when no parentless goal existed and another parentless element stood in.
    pub root_inferred: bool,
}

pub fn build_tree_from_elements(elements: &[Element], links: &[EvidenceLink]) -> Result<CaseTree> {
    if elements.is_empty() {
        return Err(LibError::empty_input());
    }

    let by_id: HashMap<ElementId, &Element> =
        elements.iter().map(|element| (element.id, element)).collect();

    let mut children: HashMap<ElementId, Vec<&Element>> = HashMap::new();
    for element in elements {
        if element.in_sandbox || !element.is_structural() {
            continue;
        }
        if let Some(parent_id) = element.parent_id {
            children.entry(parent_id).or_default().push(element);
        }
    }

    let mut evidence: HashMap<ElementId, Vec<&Element>> = HashMap::new();
    let mut seen_links = HashSet::with_capacity(links.len());
    for link in links {
        if !seen_links.insert(*link) {
            continue;
        }
        match by_id.get(&link.evidence_id) {
            Some(item) if item.kind == ElementKind::Evidence && !item.in_sandbox => {
                evidence.entry(link.property_claim_id).or_default().push(item);
            }
            _ => {
                tracing::warn!(
                    evidence_id = %link.evidence_id,
                    claim_id = %link.property_claim_id,
                    "skipping evidence link without a live evidence element"
                );
            }
        }
    }

    let (root, root_inferred) = locate_root(elements)?;
    Ok(CaseTree {
        root: emit_tree(root, &children, &evidence),
        root_inferred,
    })
}

fn locate_root(elements: &[Element]) -> Result<(&Element, bool)> {
    if let Some(root) = elements.iter().find(|element| element.is_root_goal()) {
        return Ok((root, false));
    }

    let fallback = elements.iter().find(|element| {
        element.parent_id.is_none() && !element.in_sandbox && element.is_structural()
    });
    match fallback {
        Some(root) => {
            tracing::warn!(
                case_id = %root.case_id,
                element_id = %root.id,
                kind = root.kind.as_db_value(),
                "case has no root goal; using first parentless element"
            );
            Ok((root, true))
        }
        None => Err(LibError::no_root(elements.len())),
    }
}

/// Emits the subtree under `root` without recursion: a pre-order pass lays nodes out
/// flat, then they are folded into their parents from the back. A node's descendants
/// always sit after it, so each subtree is complete before it is attached.
fn emit_tree(
    root: &Element,
    children: &HashMap<ElementId, Vec<&Element>>,
    evidence: &HashMap<ElementId, Vec<&Element>>,
) -> TreeNode {
    let mut laid_out: Vec<(Option<usize>, &Element, TreeNode)> = Vec::new();
    let mut pending = vec![(root, None)];
    while let Some((element, parent)) = pending.pop() {
        let slot = laid_out.len();
        laid_out.push((parent, element, TreeNode::leaf(element)));
        if let Some(structural) = children.get(&element.id) {
            pending.extend(structural.iter().rev().map(|child| (*child, Some(slot))));
        }
    }

    let mut emitted = None;
    while let Some((parent, element, mut node)) = laid_out.pop() {
        // Structural children arrived last-first.
        node.children.reverse();
        if element.kind == ElementKind::PropertyClaim {
            if let Some(items) = evidence.get(&element.id) {
                node.children.extend(items.iter().map(|item| TreeNode::leaf(item)));
            }
        }
        match parent {
            Some(slot) => laid_out[slot].2.children.push(node),
            None => emitted = Some(node),
        }
    }
    emitted.unwrap_or_else(|| TreeNode::leaf(root))
}

/// Removes every node whose id is in `ids` (with its subtree) below `root`.
/// Returns how many nodes were detached from their parents.
pub fn prune(root: &mut TreeNode, ids: &HashSet<ElementId>) -> usize {
    let mut removed = 0;
    let mut pending = vec![root];
    while let Some(node) = pending.pop() {
        let before = node.children.len();
        node.children.retain(|child| !ids.contains(&child.id));
        removed += before - node.children.len();
        pending.extend(node.children.iter_mut());
    }
    removed
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use serde_json::json;

    use super::*;
    use crate::models::CaseId;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1)
            .expect("valid date")
            .and_hms_opt(0, 0, 0)
            .expect("valid datetime")
    }

    fn element(
        case_id: CaseId,
        kind: ElementKind,
        name: &str,
        parent: Option<&Element>,
    ) -> Element {
        Element::new(case_id, kind, name, parent.map(|p| p.id), now())
    }

    fn link(evidence: &Element, claim: &Element) -> EvidenceLink {
        EvidenceLink {
            evidence_id: evidence.id,
            property_claim_id: claim.id,
        }
    }

    #[test]
    fn empty_input_fails() {
        let err = build_tree_from_elements(&[], &[]).expect_err("empty input");
        assert_eq!(err.code, "tree_empty_input");
    }

    #[test]
    fn evidence_alone_has_no_root() {
        let case_id = CaseId::new_v4();
        let evidence = element(case_id, ElementKind::Evidence, "E1", None);
        let err = build_tree_from_elements(&[evidence], &[]).expect_err("no root");
        assert_eq!(err.code, "tree_no_root");
    }

    #[test]
    fn goal_strategy_claim_evidence_nesting() {
        let case_id = CaseId::new_v4();
        let g1 = element(case_id, ElementKind::Goal, "G1", None);
        let s1 = element(case_id, ElementKind::Strategy, "S1", Some(&g1));
        let p1 = element(case_id, ElementKind::PropertyClaim, "P1", Some(&s1));
        let e1 = element(case_id, ElementKind::Evidence, "E1", None);
        let links = vec![link(&e1, &p1)];

        let tree = build_tree_from_elements(&[g1.clone(), s1.clone(), p1.clone(), e1.clone()], &links)
            .expect("tree should build");
        assert!(!tree.root_inferred);

        let value = serde_json::to_value(&tree.root).expect("serialize");
        assert_eq!(value["id"], json!(g1.id));
        assert_eq!(value["type"], json!("GOAL"));
        let strategy = &value["children"][0];
        assert_eq!(strategy["id"], json!(s1.id));
        assert_eq!(strategy["type"], json!("STRATEGY"));
        let claim = &strategy["children"][0];
        assert_eq!(claim["id"], json!(p1.id));
        assert_eq!(claim["type"], json!("PROPERTY_CLAIM"));
        let leaf = &claim["children"][0];
        assert_eq!(leaf["id"], json!(e1.id));
        assert_eq!(leaf["type"], json!("EVIDENCE"));
        assert_eq!(leaf["children"], json!([]));
        assert_eq!(value["children"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn shared_evidence_appears_under_each_claim() {
        let case_id = CaseId::new_v4();
        let g1 = element(case_id, ElementKind::Goal, "G1", None);
        let p1 = element(case_id, ElementKind::PropertyClaim, "P1", Some(&g1));
        let p2 = element(case_id, ElementKind::PropertyClaim, "P2", Some(&g1));
        let e1 = element(case_id, ElementKind::Evidence, "E1", None);
        let links = vec![link(&e1, &p1), link(&e1, &p2)];

        let tree = build_tree_from_elements(&[g1, p1.clone(), p2.clone(), e1.clone()], &links)
            .expect("tree should build");
        for claim in [&p1, &p2] {
            let node = tree.root.find(claim.id).expect("claim in tree");
            assert_eq!(node.children.len(), 1);
            assert_eq!(node.children[0].id, e1.id);
            assert!(node.children[0].children.is_empty());
        }
    }

    #[test]
    fn structural_children_precede_evidence() {
        let case_id = CaseId::new_v4();
        let g1 = element(case_id, ElementKind::Goal, "G1", None);
        let p1 = element(case_id, ElementKind::PropertyClaim, "P1", Some(&g1));
        let e1 = element(case_id, ElementKind::Evidence, "E1", None);
        let p2 = element(case_id, ElementKind::PropertyClaim, "P2", Some(&p1));

        let tree = build_tree_from_elements(
            &[g1, p1.clone(), e1.clone(), p2.clone()],
            &[link(&e1, &p1)],
        )
        .expect("tree should build");
        let claim = tree.root.find(p1.id).expect("claim");
        let order = claim.children.iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(order, vec![p2.id, e1.id]);
    }

    #[test]
    fn building_is_deterministic() {
        let case_id = CaseId::new_v4();
        let g1 = element(case_id, ElementKind::Goal, "G1", None);
        let s1 = element(case_id, ElementKind::Strategy, "S1", Some(&g1));
        let p1 = element(case_id, ElementKind::PropertyClaim, "P1", Some(&s1));
        let p2 = element(case_id, ElementKind::PropertyClaim, "P2", Some(&s1));
        let e1 = element(case_id, ElementKind::Evidence, "E1", None);
        let elements = vec![g1, s1, p1.clone(), p2.clone(), e1.clone()];
        let links = vec![link(&e1, &p2), link(&e1, &p1)];

        let first = build_tree_from_elements(&elements, &links).expect("first");
        let second = build_tree_from_elements(&elements, &links).expect("second");
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first.root).expect("serialize"),
            serde_json::to_string(&second.root).expect("serialize")
        );
        assert_eq!(first.root.preorder_ids(), second.root.preorder_ids());
    }

    #[test]
    fn sandboxed_elements_are_excluded() {
        let case_id = CaseId::new_v4();
        let g1 = element(case_id, ElementKind::Goal, "G1", None);
        let mut orphan = element(case_id, ElementKind::PropertyClaim, "P1", None);
        orphan.in_sandbox = true;
        let mut orphan_evidence = element(case_id, ElementKind::Evidence, "E1", None);
        orphan_evidence.in_sandbox = true;

        let tree = build_tree_from_elements(&[orphan, g1.clone(), orphan_evidence], &[])
            .expect("tree should build");
        assert_eq!(tree.root.id, g1.id);
        assert!(tree.root.children.is_empty());
    }

    #[test]
    fn missing_goal_falls_back_and_flags() {
        let case_id = CaseId::new_v4();
        let strategy = element(case_id, ElementKind::Strategy, "S1", None);
        let tree = build_tree_from_elements(&[strategy.clone()], &[]).expect("fallback root");
        assert!(tree.root_inferred);
        assert_eq!(tree.root.id, strategy.id);
    }

    #[test]
    fn dangling_links_are_skipped() {
        let case_id = CaseId::new_v4();
        let g1 = element(case_id, ElementKind::Goal, "G1", None);
        let p1 = element(case_id, ElementKind::PropertyClaim, "P1", Some(&g1));
        let links = vec![EvidenceLink {
            evidence_id: ElementId::new_v4(),
            property_claim_id: p1.id,
        }];
        let tree = build_tree_from_elements(&[g1, p1.clone()], &links).expect("tree");
        assert!(tree.root.find(p1.id).expect("claim").children.is_empty());
    }

    #[test]
    fn prune_removes_subtrees() {
        let case_id = CaseId::new_v4();
        let g1 = element(case_id, ElementKind::Goal, "G1", None);
        let p1 = element(case_id, ElementKind::PropertyClaim, "P1", Some(&g1));
        let p2 = element(case_id, ElementKind::PropertyClaim, "P2", Some(&p1));
        let p3 = element(case_id, ElementKind::PropertyClaim, "P3", Some(&g1));
        let mut tree = build_tree_from_elements(&[g1, p1.clone(), p2.clone(), p3.clone()], &[])
            .expect("tree")
            .root;

        let removed = prune(&mut tree, &HashSet::from([p1.id]));
        assert_eq!(removed, 1);
        assert!(tree.find(p1.id).is_none());
        assert!(tree.find(p2.id).is_none());
        assert!(tree.find(p3.id).is_some());
    }

    #[test]
    fn deep_claim_chains_build_and_prune_without_recursion() {
        const DEPTH: usize = 20_000;
        let case_id = CaseId::new_v4();
        let mut elements = vec![element(case_id, ElementKind::Goal, "G1", None)];
        for n in 1..=DEPTH {
            let parent = elements.last().cloned();
            elements.push(element(
                case_id,
                ElementKind::PropertyClaim,
                &format!("P{n}"),
                parent.as_ref(),
            ));
        }
        let deepest = elements[DEPTH].clone();
        let evidence = element(case_id, ElementKind::Evidence, "E1", None);
        let links = vec![link(&evidence, &deepest)];
        elements.push(evidence.clone());

        let mut tree = build_tree_from_elements(&elements, &links).expect("tree").root;
        let mut depth = 0;
        let mut cursor = &tree;
        while let Some(child) = cursor.children.first() {
            assert_eq!(cursor.children.len(), 1);
            depth += 1;
            cursor = child;
        }
        assert_eq!(depth, DEPTH + 1);
        assert_eq!(cursor.id, evidence.id);
        assert_eq!(tree.preorder_ids().len(), DEPTH + 2);
        assert!(tree.find(deepest.id).is_some());

        let middle = elements[DEPTH / 2].id;
        assert_eq!(prune(&mut tree, &HashSet::from([middle])), 1);
        assert!(tree.find(deepest.id).is_none());
        assert_eq!(tree.preorder_ids().len(), DEPTH / 2);
    }
}
