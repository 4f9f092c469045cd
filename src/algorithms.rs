use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::{Element, ElementId, ElementKind, EvidenceLink};

/// Parent → structural children for active elements, in input order.
pub fn adjacency_map(elements: &[Element]) -> HashMap<ElementId, Vec<ElementId>> {
    let known: HashSet<ElementId> = elements.iter().map(|element| element.id).collect();
    let mut adjacency: HashMap<ElementId, Vec<ElementId>> = HashMap::new();
    for element in elements {
        if element.in_sandbox || !element.is_structural() {
            continue;
        }
        let Some(parent_id) = element.parent_id else {
            continue;
        };
        if !known.contains(&parent_id) {
            // Dangling parents are reported by the invariant checks.
            continue;
        }
        adjacency.entry(parent_id).or_default().push(element.id);
    }
    adjacency
}

/// `root` followed by every active structural descendant, breadth first.
pub fn descendant_ids(elements: &[Element], root: ElementId) -> Vec<ElementId> {
    let adjacency = adjacency_map(elements);
    let mut ordered = vec![root];
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(node_id) = queue.pop_front() {
        if let Some(children) = adjacency.get(&node_id) {
            for child in children {
                if seen.insert(*child) {
                    ordered.push(*child);
                    queue.push_back(*child);
                }
            }
        }
    }
    ordered
}

pub fn is_descendant(elements: &[Element], ancestor: ElementId, candidate: ElementId) -> bool {
    ancestor != candidate && descendant_ids(elements, ancestor).contains(&candidate)
}

/// Evidence ids linked to any claim in `claims`, first-seen order.
pub fn linked_evidence_ids(
    elements: &[Element],
    links: &[EvidenceLink],
    claims: &[ElementId],
) -> Vec<ElementId> {
    let claim_set: HashSet<ElementId> = elements
        .iter()
        .filter(|element| element.kind == ElementKind::PropertyClaim && claims.contains(&element.id))
        .map(|element| element.id)
        .collect();
    let mut seen = HashSet::new();
    links
        .iter()
        .filter(|link| claim_set.contains(&link.property_claim_id))
        .filter(|link| seen.insert(link.evidence_id))
        .map(|link| link.evidence_id)
        .collect()
}

pub fn has_cycle(elements: &[Element]) -> bool {
    let active = elements
        .iter()
        .filter(|element| !element.in_sandbox && element.is_structural())
        .count();
    topological_sort(elements).len() != active
}

/// Active structural elements ordered parents-first.
pub fn topological_sort(elements: &[Element]) -> Vec<&Element> {
    let mut node_lookup = HashMap::with_capacity(elements.len());
    let mut indegree: HashMap<ElementId, usize> = HashMap::with_capacity(elements.len());
    for element in elements {
        if element.in_sandbox || !element.is_structural() {
            continue;
        }
        node_lookup.insert(element.id, element);
        indegree.insert(element.id, 0);
    }

    let adjacency = adjacency_map(elements);
    for children in adjacency.values() {
        for child in children {
            if let Some(degree) = indegree.get_mut(child) {
                *degree += 1;
            }
        }
    }

    let mut queue = elements
        .iter()
        .filter(|element| indegree.get(&element.id) == Some(&0))
        .map(|element| element.id)
        .collect::<VecDeque<_>>();

    let mut ordered = Vec::with_capacity(node_lookup.len());
    while let Some(node_id) = queue.pop_front() {
        if let Some(node) = node_lookup.get(&node_id) {
            ordered.push(*node);
        }
        if let Some(children) = adjacency.get(&node_id) {
            for child in children {
                if let Some(child_degree) = indegree.get_mut(child) {
                    *child_degree -= 1;
                    if *child_degree == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }
    }

    ordered
}
