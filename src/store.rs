//! Persistent store seam. The mutation service only ever talks to [`CaseStore`];
//! `MemoryStore` backs tests and single-process use, `db::PgCaseStore` backs deployments.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use chrono::{NaiveDateTime, Utc};

use crate::error::{LibError, Result};
use crate::models::{
    AssuranceCase, CaseId, Comment, CommentId, Element, ElementId, ElementKind, EvidenceLink,
    TeamId, UserId,
};
use crate::permissions::PermissionLevel;

/// One all-or-nothing change to a case's elements and evidence links.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaseWrite {
    pub upsert_elements: Vec<Element>,
    pub delete_elements: Vec<ElementId>,
    pub add_links: Vec<EvidenceLink>,
    pub remove_links: Vec<EvidenceLink>,
}

impl CaseWrite {
    pub fn is_empty(&self) -> bool {
        self.upsert_elements.is_empty()
            && self.delete_elements.is_empty()
            && self.add_links.is_empty()
            && self.remove_links.is_empty()
    }

    pub fn upsert(&mut self, element: Element) {
        if let Some(existing) = self
            .upsert_elements
            .iter_mut()
            .find(|pending| pending.id == element.id)
        {
            *existing = element;
        } else {
            self.upsert_elements.push(element);
        }
    }

    /// Applies the write to an in-memory copy of a case, in the order a store must:
    /// link removals, element deletions (with their links), upserts, link additions.
    pub fn apply_to(&self, elements: &mut Vec<Element>, links: &mut Vec<EvidenceLink>) {
        let removed: HashSet<EvidenceLink> = self.remove_links.iter().copied().collect();
        let deleted: HashSet<ElementId> = self.delete_elements.iter().copied().collect();

        links.retain(|link| {
            !removed.contains(link)
                && !deleted.contains(&link.evidence_id)
                && !deleted.contains(&link.property_claim_id)
        });
        elements.retain(|element| !deleted.contains(&element.id));

        for element in &self.upsert_elements {
            match elements.iter_mut().find(|existing| existing.id == element.id) {
                Some(existing) => *existing = element.clone(),
                None => elements.push(element.clone()),
            }
        }

        for link in &self.add_links {
            if !links.contains(link) {
                links.push(*link);
            }
        }
    }

    /// Preview of a case after this write.
    pub fn preview(
        &self,
        elements: &[Element],
        links: &[EvidenceLink],
    ) -> (Vec<Element>, Vec<EvidenceLink>) {
        let mut elements = elements.to_vec();
        let mut links = links.to_vec();
        self.apply_to(&mut elements, &mut links);
        (elements, links)
    }
}

/// Opaque persistence interface. Element and link listings come back in insertion
/// order so the tree builder sees a stable input.
pub trait CaseStore: Send + Sync + 'static {
    fn get_case(&self, case_id: CaseId)
    -> impl Future<Output = Result<Option<AssuranceCase>>> + Send;

    /// Stores a new case together with its root goal.
    fn insert_case(
        &self,
        case: &AssuranceCase,
        root: &Element,
    ) -> impl Future<Output = Result<()>> + Send;

    fn update_case(&self, case: &AssuranceCase) -> impl Future<Output = Result<()>> + Send;

    fn list_elements(&self, case_id: CaseId)
    -> impl Future<Output = Result<Vec<Element>>> + Send;

    fn list_evidence_links(
        &self,
        case_id: CaseId,
    ) -> impl Future<Output = Result<Vec<EvidenceLink>>> + Send;

    fn get_element(
        &self,
        element_id: ElementId,
    ) -> impl Future<Output = Result<Option<Element>>> + Send;

    /// Commits `write` atomically and bumps the case's `updated_at`.
    fn apply(&self, case_id: CaseId, write: &CaseWrite)
    -> impl Future<Output = Result<()>> + Send;

    fn list_comments(&self, case_id: CaseId)
    -> impl Future<Output = Result<Vec<Comment>>> + Send;

    fn get_comment(
        &self,
        comment_id: CommentId,
    ) -> impl Future<Output = Result<Option<Comment>>> + Send;

    fn upsert_comment(&self, comment: &Comment) -> impl Future<Output = Result<()>> + Send;

    fn delete_comments(&self, comment_ids: &[CommentId])
    -> impl Future<Output = Result<()>> + Send;

    fn user_permission(
        &self,
        case_id: CaseId,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<PermissionLevel>>> + Send;

    /// Grants held by teams `user_id` belongs to.
    fn team_permissions_for_user(
        &self,
        case_id: CaseId,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<PermissionLevel>>> + Send;

    /// `None` revokes.
    fn set_user_permission(
        &self,
        case_id: CaseId,
        user_id: UserId,
        level: Option<PermissionLevel>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn set_team_permission(
        &self,
        case_id: CaseId,
        team_id: TeamId,
        level: Option<PermissionLevel>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Resolves an unexpired session token to its user.
    fn find_session(&self, token: &str) -> impl Future<Output = Result<Option<UserId>>> + Send;
}

#[derive(Debug, Default)]
struct MemoryState {
    cases: HashMap<CaseId, AssuranceCase>,
    elements: Vec<Element>,
    links: Vec<(CaseId, EvidenceLink)>,
    comments: Vec<Comment>,
    user_grants: HashMap<(CaseId, UserId), PermissionLevel>,
    team_grants: HashMap<(CaseId, TeamId), PermissionLevel>,
    memberships: HashSet<(TeamId, UserId)>,
    sessions: HashMap<String, (UserId, NaiveDateTime)>,
    writes: usize,
    fail_writes: bool,
}

impl MemoryState {
    fn begin_write(&mut self) -> Result<()> {
        if self.fail_writes {
            return Err(LibError::database(
                "Failed to write case",
                anyhow!("memory store configured to fail writes"),
            ));
        }
        self.writes += 1;
        Ok(())
    }
}

/// In-process store. Writes are atomic under one lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of committed writes so far.
    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    /// Makes every following write fail with a database error.
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn add_team_member(&self, team_id: TeamId, user_id: UserId) {
        self.state().memberships.insert((team_id, user_id));
    }

    pub fn insert_session(&self, token: impl Into<String>, user_id: UserId, expires_at: NaiveDateTime) {
        self.state()
            .sessions
            .insert(token.into(), (user_id, expires_at));
    }

    /// Creates a case with a root goal "G1" owned by `owner`, bypassing authorization.
    pub async fn seed_case(&self, owner: UserId, name: &str) -> AssuranceCase {
        let now = Utc::now().naive_utc();
        let case = AssuranceCase {
            id: CaseId::new_v4(),
            owner_user_id: owner,
            name: name.to_string(),
            description: None,
            edit_lock: None,
            created_at: now,
            updated_at: now,
        };
        let root = Element::new(case.id, ElementKind::Goal, "G1", None, now);
        let mut state = self.state();
        state.cases.insert(case.id, case.clone());
        state.elements.push(root);
        case
    }

    /// Inserts raw rows without validation.
    pub fn seed_elements(&self, elements: &[Element], links: &[EvidenceLink]) {
        let mut state = self.state();
        state.elements.extend(elements.iter().cloned());
        for link in links {
            let case_id = state
                .elements
                .iter()
                .find(|element| element.id == link.evidence_id)
                .map(|element| element.case_id)
                .unwrap_or_default();
            state.links.push((case_id, *link));
        }
    }
}

impl CaseStore for MemoryStore {
    async fn get_case(&self, case_id: CaseId) -> Result<Option<AssuranceCase>> {
        Ok(self.state().cases.get(&case_id).cloned())
    }

    async fn insert_case(&self, case: &AssuranceCase, root: &Element) -> Result<()> {
        let mut state = self.state();
        state.begin_write()?;
        state.cases.insert(case.id, case.clone());
        state.elements.push(root.clone());
        Ok(())
    }

    async fn update_case(&self, case: &AssuranceCase) -> Result<()> {
        let mut state = self.state();
        state.begin_write()?;
        match state.cases.get_mut(&case.id) {
            Some(existing) => {
                *existing = case.clone();
                Ok(())
            }
            None => Err(LibError::not_found(
                "Case not found",
                anyhow!("case {} not found", case.id),
            )),
        }
    }

    async fn list_elements(&self, case_id: CaseId) -> Result<Vec<Element>> {
        Ok(self
            .state()
            .elements
            .iter()
            .filter(|element| element.case_id == case_id)
            .cloned()
            .collect())
    }

    async fn list_evidence_links(&self, case_id: CaseId) -> Result<Vec<EvidenceLink>> {
        Ok(self
            .state()
            .links
            .iter()
            .filter(|(owner, _)| *owner == case_id)
            .map(|(_, link)| *link)
            .collect())
    }

    async fn get_element(&self, element_id: ElementId) -> Result<Option<Element>> {
        Ok(self
            .state()
            .elements
            .iter()
            .find(|element| element.id == element_id)
            .cloned())
    }

    async fn apply(&self, case_id: CaseId, write: &CaseWrite) -> Result<()> {
        let mut state = self.state();
        state.begin_write()?;

        let (mut case_elements, others): (Vec<Element>, Vec<Element>) = state
            .elements
            .drain(..)
            .partition(|element| element.case_id == case_id);
        let (case_links, other_links): (Vec<_>, Vec<_>) = state
            .links
            .drain(..)
            .partition(|(owner, _)| *owner == case_id);
        let mut case_links = case_links
            .into_iter()
            .map(|(_, link)| link)
            .collect::<Vec<_>>();

        write.apply_to(&mut case_elements, &mut case_links);

        let deleted: HashSet<ElementId> = write.delete_elements.iter().copied().collect();
        state
            .comments
            .retain(|comment| comment.element_id.is_none_or(|id| !deleted.contains(&id)));

        state.elements = others;
        state.elements.extend(case_elements);
        state.links = other_links;
        state
            .links
            .extend(case_links.into_iter().map(|link| (case_id, link)));

        if let Some(case) = state.cases.get_mut(&case_id) {
            case.updated_at = Utc::now().naive_utc();
        }
        Ok(())
    }

    async fn list_comments(&self, case_id: CaseId) -> Result<Vec<Comment>> {
        Ok(self
            .state()
            .comments
            .iter()
            .filter(|comment| comment.case_id == case_id)
            .cloned()
            .collect())
    }

    async fn get_comment(&self, comment_id: CommentId) -> Result<Option<Comment>> {
        Ok(self
            .state()
            .comments
            .iter()
            .find(|comment| comment.id == comment_id)
            .cloned())
    }

    async fn upsert_comment(&self, comment: &Comment) -> Result<()> {
        let mut state = self.state();
        state.begin_write()?;
        match state
            .comments
            .iter_mut()
            .find(|existing| existing.id == comment.id)
        {
            Some(existing) => *existing = comment.clone(),
            None => state.comments.push(comment.clone()),
        }
        Ok(())
    }

    async fn delete_comments(&self, comment_ids: &[CommentId]) -> Result<()> {
        let mut state = self.state();
        state.begin_write()?;
        state
            .comments
            .retain(|comment| !comment_ids.contains(&comment.id));
        Ok(())
    }

    async fn user_permission(
        &self,
        case_id: CaseId,
        user_id: UserId,
    ) -> Result<Option<PermissionLevel>> {
        Ok(self.state().user_grants.get(&(case_id, user_id)).copied())
    }

    async fn team_permissions_for_user(
        &self,
        case_id: CaseId,
        user_id: UserId,
    ) -> Result<Vec<PermissionLevel>> {
        let state = self.state();
        Ok(state
            .team_grants
            .iter()
            .filter(|((grant_case, team_id), _)| {
                *grant_case == case_id && state.memberships.contains(&(*team_id, user_id))
            })
            .map(|(_, level)| *level)
            .collect())
    }

    async fn set_user_permission(
        &self,
        case_id: CaseId,
        user_id: UserId,
        level: Option<PermissionLevel>,
    ) -> Result<()> {
        let mut state = self.state();
        state.begin_write()?;
        match level {
            Some(level) => state.user_grants.insert((case_id, user_id), level),
            None => state.user_grants.remove(&(case_id, user_id)),
        };
        Ok(())
    }

    async fn set_team_permission(
        &self,
        case_id: CaseId,
        team_id: TeamId,
        level: Option<PermissionLevel>,
    ) -> Result<()> {
        let mut state = self.state();
        state.begin_write()?;
        match level {
            Some(level) => state.team_grants.insert((case_id, team_id), level),
            None => state.team_grants.remove(&(case_id, team_id)),
        };
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<UserId>> {
        let now = Utc::now().naive_utc();
        Ok(self
            .state()
            .sessions
            .get(token)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(user_id, _)| *user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn apply_to_orders_removals_before_additions() {
        let case_id = CaseId::new_v4();
        let now = Utc::now().naive_utc();
        let claim = Element::new(case_id, ElementKind::PropertyClaim, "P1", None, now);
        let evidence = Element::new(case_id, ElementKind::Evidence, "E1", None, now);
        let link = EvidenceLink {
            evidence_id: evidence.id,
            property_claim_id: claim.id,
        };
        let mut elements = vec![claim.clone(), evidence.clone()];
        let mut links = vec![link];

        let write = CaseWrite {
            remove_links: vec![link],
            add_links: vec![link],
            ..CaseWrite::default()
        };
        write.apply_to(&mut elements, &mut links);
        assert_eq!(links, vec![link]);

        let write = CaseWrite {
            delete_elements: vec![claim.id],
            ..CaseWrite::default()
        };
        write.apply_to(&mut elements, &mut links);
        assert!(links.is_empty());
        assert_eq!(elements, vec![evidence]);
    }

    #[test]
    fn upsert_replaces_pending_element() {
        let now = Utc::now().naive_utc();
        let mut element = Element::new(CaseId::new_v4(), ElementKind::Goal, "G1", None, now);
        let mut write = CaseWrite::default();
        write.upsert(element.clone());
        element.description = "changed".to_string();
        write.upsert(element.clone());
        assert_eq!(write.upsert_elements, vec![element]);
    }

    #[tokio::test]
    async fn failed_write_changes_nothing() {
        let store = MemoryStore::new();
        let case = store.seed_case(UserId::new_v4(), "Case").await;
        store.fail_writes(true);

        let now = Utc::now().naive_utc();
        let write = CaseWrite {
            upsert_elements: vec![Element::new(
                case.id,
                ElementKind::Strategy,
                "S1",
                None,
                now,
            )],
            ..CaseWrite::default()
        };
        let err = store.apply(case.id, &write).await.expect_err("write fails");
        assert_eq!(err.kind, ErrorKind::Database);
        assert_eq!(store.list_elements(case.id).await.expect("list").len(), 1);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn expired_sessions_do_not_resolve() {
        let store = MemoryStore::new();
        let user = UserId::new_v4();
        let now = Utc::now().naive_utc();
        store.insert_session("live", user, now + chrono::Duration::hours(1));
        store.insert_session("stale", user, now - chrono::Duration::hours(1));

        assert_eq!(store.find_session("live").await.expect("lookup"), Some(user));
        assert_eq!(store.find_session("stale").await.expect("lookup"), None);
        assert_eq!(store.find_session("missing").await.expect("lookup"), None);
    }
}
