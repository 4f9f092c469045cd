use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::algorithms;
use crate::error::{LibError, Result};
use crate::events::{Broadcaster, CaseEventType};
use crate::invariants::{ensure_case_invariants, placement_allowed, sibling_hidden};
use crate::models::{
    AssuranceCase, AttachEvidencePayload, CaseId, CaseSnapshot, Comment, CommentId,
    CreateCasePayload, CreateCommentPayload, CreateElementPayload, EditLock, Element, ElementId,
    ElementKind, EvidenceLink, MoveTarget, ResolveCommentPayload, TeamId, TreeNode,
    UpdateCommentPayload, UpdateElementPayload, UserId, next_label, normalize_claim_ids,
    normalize_name,
};
use crate::permissions::{
    self, CASE_COMMENT_LEVEL, CASE_EDIT_LEVEL, CASE_READ_LEVEL, CASE_SHARE_LEVEL, CaseAccess,
    PermissionLevel,
};
use crate::store::{CaseStore, CaseWrite};
use crate::tree::{self, build_tree_from_elements};

/// High-level case actions.
///
/// Callers must provide a trusted `actor` sourced from validated session state,
/// never from request bodies.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum CaseOperation {
    CreateCase {
        payload: CreateCasePayload,
    },
    GetCase {
        case_id: CaseId,
    },
    CaseAccess {
        case_id: CaseId,
    },
    CreateElement {
        case_id: CaseId,
        payload: CreateElementPayload,
    },
    UpdateElement {
        element_id: ElementId,
        payload: UpdateElementPayload,
    },
    MoveElement {
        element_id: ElementId,
        target: MoveTarget,
    },
    DetachElement {
        element_id: ElementId,
    },
    DeleteElement {
        element_id: ElementId,
    },
    AttachEvidence {
        element_id: ElementId,
        payload: AttachEvidencePayload,
    },
    ListComments {
        case_id: CaseId,
    },
    CreateComment {
        case_id: CaseId,
        payload: CreateCommentPayload,
    },
    UpdateComment {
        comment_id: CommentId,
        payload: UpdateCommentPayload,
    },
    DeleteComment {
        comment_id: CommentId,
    },
    ResolveComment {
        comment_id: CommentId,
        payload: ResolveCommentPayload,
    },
    SetUserPermission {
        case_id: CaseId,
        user_id: UserId,
        payload: SetPermissionPayload,
    },
    SetTeamPermission {
        case_id: CaseId,
        team_id: TeamId,
        payload: SetPermissionPayload,
    },
    AcquireLock {
        case_id: CaseId,
    },
    ReleaseLock {
        case_id: CaseId,
    },
}

/// `None` revokes the grant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPermissionPayload {
    pub permission: Option<PermissionLevel>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CaseOperationResult {
    Snapshot { snapshot: CaseSnapshot },
    Access { access: CaseAccess },
    Comment { comment: Comment },
    Comments { comments: Vec<Comment> },
    CommentsDeleted { comment_ids: Vec<CommentId> },
    Permission { permission: Option<PermissionLevel> },
    Lock { lock: Option<EditLock> },
}

type CaseGuards = Mutex<HashMap<CaseId, Arc<tokio::sync::Mutex<()>>>>;

/// The mutation service: every write runs authorize, persist, then recompute-and-broadcast.
/// Nothing is broadcast unless the store accepted the write.
///
/// Writes to one case are serialized: the case guard is held from the first read of
/// the case state until the store has applied the write, so every plan is validated
/// against the state it is applied to. Clones share the guards.
#[derive(Debug)]
pub struct CaseOperations<S> {
    store: Arc<S>,
    broadcaster: Arc<Broadcaster>,
    case_guards: Arc<CaseGuards>,
}

impl<S> Clone for CaseOperations<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            broadcaster: Arc::clone(&self.broadcaster),
            case_guards: Arc::clone(&self.case_guards),
        }
    }
}

impl<S: CaseStore> CaseOperations<S> {
    pub fn new(store: Arc<S>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            store,
            broadcaster,
            case_guards: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub async fn execute(
        &self,
        actor: UserId,
        operation: CaseOperation,
    ) -> Result<CaseOperationResult> {
        let snapshot = |snapshot| CaseOperationResult::Snapshot { snapshot };
        match operation {
            CaseOperation::CreateCase { payload } => {
                self.create_case(actor, payload).await.map(snapshot)
            }
            CaseOperation::GetCase { case_id } => self.get_case(actor, case_id).await.map(snapshot),
            CaseOperation::CaseAccess { case_id } => {
                let access = self.case_access(actor, case_id).await?;
                Ok(CaseOperationResult::Access { access })
            }
            CaseOperation::CreateElement { case_id, payload } => self
                .create_element(actor, case_id, payload)
                .await
                .map(snapshot),
            CaseOperation::UpdateElement {
                element_id,
                payload,
            } => self
                .update_element(actor, element_id, payload)
                .await
                .map(snapshot),
            CaseOperation::MoveElement { element_id, target } => self
                .move_element(actor, element_id, target)
                .await
                .map(snapshot),
            CaseOperation::DetachElement { element_id } => {
                self.detach_element(actor, element_id).await.map(snapshot)
            }
            CaseOperation::DeleteElement { element_id } => {
                self.delete_element(actor, element_id).await.map(snapshot)
            }
            CaseOperation::AttachEvidence {
                element_id,
                payload,
            } => self
                .attach_evidence(actor, element_id, payload)
                .await
                .map(snapshot),
            CaseOperation::ListComments { case_id } => {
                let comments = self.list_comments(actor, case_id).await?;
                Ok(CaseOperationResult::Comments { comments })
            }
            CaseOperation::CreateComment { case_id, payload } => {
                let comment = self.create_comment(actor, case_id, payload).await?;
                Ok(CaseOperationResult::Comment { comment })
            }
            CaseOperation::UpdateComment {
                comment_id,
                payload,
            } => {
                let comment = self.update_comment(actor, comment_id, payload).await?;
                Ok(CaseOperationResult::Comment { comment })
            }
            CaseOperation::DeleteComment { comment_id } => {
                let comment_ids = self.delete_comment(actor, comment_id).await?;
                Ok(CaseOperationResult::CommentsDeleted { comment_ids })
            }
            CaseOperation::ResolveComment {
                comment_id,
                payload,
            } => {
                let comment = self.resolve_comment(actor, comment_id, payload).await?;
                Ok(CaseOperationResult::Comment { comment })
            }
            CaseOperation::SetUserPermission {
                case_id,
                user_id,
                payload,
            } => {
                let permission = self
                    .set_user_permission(actor, case_id, user_id, payload.permission)
                    .await?;
                Ok(CaseOperationResult::Permission { permission })
            }
            CaseOperation::SetTeamPermission {
                case_id,
                team_id,
                payload,
            } => {
                let permission = self
                    .set_team_permission(actor, case_id, team_id, payload.permission)
                    .await?;
                Ok(CaseOperationResult::Permission { permission })
            }
            CaseOperation::AcquireLock { case_id } => {
                let lock = self.acquire_lock(actor, case_id).await?;
                Ok(CaseOperationResult::Lock { lock: Some(lock) })
            }
            CaseOperation::ReleaseLock { case_id } => {
                self.release_lock(actor, case_id).await?;
                Ok(CaseOperationResult::Lock { lock: None })
            }
        }
    }

    pub async fn create_case(
        &self,
        actor: UserId,
        payload: CreateCasePayload,
    ) -> Result<CaseSnapshot> {
        let name = normalize_name(&payload.name, "Case name is required")?;
        let now = Utc::now().naive_utc();
        let case = AssuranceCase {
            id: CaseId::new_v4(),
            owner_user_id: actor,
            name,
            description: payload.description,
            edit_lock: None,
            created_at: now,
            updated_at: now,
        };
        let mut root = Element::new(case.id, ElementKind::Goal, "G1", None, now);
        root.description = payload.goal_description.unwrap_or_default();

        self.store.insert_case(&case, &root).await?;
        tracing::info!(case_id = %case.id, owner = %actor, "case created");
        snapshot_from(case, &[root], &[])
    }

    pub async fn get_case(&self, actor: UserId, case_id: CaseId) -> Result<CaseSnapshot> {
        let (case, _) =
            permissions::require_case_permission(&*self.store, actor, case_id, CASE_READ_LEVEL)
                .await?;
        let elements = self.store.list_elements(case_id).await?;
        let links = self.store.list_evidence_links(case_id).await?;
        snapshot_from(case, &elements, &links)
    }

    pub async fn case_access(&self, actor: UserId, case_id: CaseId) -> Result<CaseAccess> {
        permissions::case_access(&*self.store, actor, case_id).await
    }

    pub async fn create_element(
        &self,
        actor: UserId,
        case_id: CaseId,
        payload: CreateElementPayload,
    ) -> Result<CaseSnapshot> {
        let _guard = self.lock_case(case_id).await;
        let (case, _) =
            permissions::require_case_permission(&*self.store, actor, case_id, CASE_EDIT_LEVEL)
                .await?;
        ensure_unlocked(&case, actor)?;
        let state = self.load_state(case).await?;
        let (write, element) = plan_create(
            &state.elements,
            &state.links,
            state.case.id,
            payload,
            Utc::now().naive_utc(),
        )?;
        let payload = json!({
            "elementId": element.id,
            "kind": element.kind,
            "name": element.name,
            "parentId": element.parent_id,
        });
        self.commit(actor, state, write, CaseEventType::ElementCreated, payload)
            .await
    }

    /// Partial update. A `target` moves the element, `claimIds` replaces an evidence
    /// item's links; both recompute the visibility flag from the new siblings.
    pub async fn update_element(
        &self,
        actor: UserId,
        element_id: ElementId,
        payload: UpdateElementPayload,
    ) -> Result<CaseSnapshot> {
        let (_guard, state, element) = self.load_for_edit(actor, element_id).await?;
        let write = plan_update(&state.elements, &state.links, &element, payload)?;
        let payload = json!({ "elementId": element.id });
        self.commit(actor, state, write, CaseEventType::ElementUpdated, payload)
            .await
    }

    pub async fn move_element(
        &self,
        actor: UserId,
        element_id: ElementId,
        target: MoveTarget,
    ) -> Result<CaseSnapshot> {
        let (_guard, state, element) = self.load_for_edit(actor, element_id).await?;
        let write = plan_move(&state.elements, &state.links, &element, target)?;
        let payload = json!({ "elementId": element.id, "target": target });
        self.commit(actor, state, write, CaseEventType::ElementUpdated, payload)
            .await
    }

    pub async fn detach_element(&self, actor: UserId, element_id: ElementId) -> Result<CaseSnapshot> {
        let (_guard, state, element) = self.load_for_edit(actor, element_id).await?;
        let write = plan_detach(&state.elements, &state.links, &element)?;
        let detached = write
            .upsert_elements
            .iter()
            .map(|element| element.id)
            .collect::<Vec<_>>();
        let payload = json!({ "elementId": element.id, "detachedIds": detached });
        self.commit(actor, state, write, CaseEventType::ElementDetached, payload)
            .await
    }

    /// Permanent removal. The returned tree is the pre-delete tree with the removed
    /// nodes pruned out.
    pub async fn delete_element(&self, actor: UserId, element_id: ElementId) -> Result<CaseSnapshot> {
        let (_guard, state, element) = self.load_for_edit(actor, element_id).await?;
        let write = plan_delete(&state.elements, &state.links, &element)?;
        let (elements, links) = write.preview(&state.elements, &state.links);
        ensure_case_invariants(state.case.id, &elements, &links)?;

        let deleted: HashSet<ElementId> = write.delete_elements.iter().copied().collect();
        let before = state
            .elements
            .iter()
            .cloned()
            .map(|mut element| {
                if element.defeats_element_id.is_some_and(|id| deleted.contains(&id)) {
                    element.defeats_element_id = None;
                }
                element
            })
            .collect::<Vec<_>>();
        let mut current = build_tree_from_elements(&before, &state.links)?;
        self.store.apply(state.case.id, &write).await?;

        self.broadcaster.emit_event(
            CaseEventType::ElementDeleted,
            state.case.id,
            json!({ "elementId": element.id, "deletedIds": write.delete_elements }),
            Some(actor),
        );

        let pruned = tree::prune(&mut current.root, &deleted);
        tracing::debug!(case_id = %state.case.id, %element_id, pruned, "element deleted");
        let case = self.reload_case(state.case).await;
        Ok(CaseSnapshot {
            case,
            tree: current.root,
            root_inferred: current.root_inferred,
            orphaned_elements: orphaned_nodes(&elements),
        })
    }

    pub async fn attach_evidence(
        &self,
        actor: UserId,
        element_id: ElementId,
        payload: AttachEvidencePayload,
    ) -> Result<CaseSnapshot> {
        let (_guard, state, element) = self.load_for_edit(actor, element_id).await?;
        let write = plan_attach(&state.elements, &state.links, &element, &payload.claim_ids, false)?;
        let payload = json!({ "elementId": element.id, "claimIds": payload.claim_ids });
        self.commit(actor, state, write, CaseEventType::ElementAttached, payload)
            .await
    }

    pub async fn list_comments(&self, actor: UserId, case_id: CaseId) -> Result<Vec<Comment>> {
        permissions::require_case_permission(&*self.store, actor, case_id, CASE_READ_LEVEL)
            .await?;
        self.store.list_comments(case_id).await
    }

    pub async fn create_comment(
        &self,
        actor: UserId,
        case_id: CaseId,
        payload: CreateCommentPayload,
    ) -> Result<Comment> {
        permissions::require_case_permission(&*self.store, actor, case_id, CASE_COMMENT_LEVEL)
            .await?;
        let content = normalize_name(&payload.content, "Comment content is required")?;

        if let Some(element_id) = payload.element_id {
            self.load_element_in_case(case_id, element_id).await?;
        }
        if let Some(parent_id) = payload.parent_comment_id {
            let parent = self.load_comment(parent_id).await?;
            if parent.case_id != case_id {
                return Err(LibError::invalid(
                    "Reply must belong to the same case",
                    anyhow!("comment {} is not in case {}", parent_id, case_id),
                ));
            }
        }

        let now = Utc::now().naive_utc();
        let comment = Comment {
            id: CommentId::new_v4(),
            case_id,
            element_id: payload.element_id,
            author_id: actor,
            parent_comment_id: payload.parent_comment_id,
            content,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_comment(&comment).await?;
        self.emit_comment(CaseEventType::CommentCreated, &comment, actor);
        Ok(comment)
    }

    pub async fn update_comment(
        &self,
        actor: UserId,
        comment_id: CommentId,
        payload: UpdateCommentPayload,
    ) -> Result<Comment> {
        let mut comment = self.load_comment(comment_id).await?;
        permissions::require_case_permission(
            &*self.store,
            actor,
            comment.case_id,
            CASE_COMMENT_LEVEL,
        )
        .await?;
        if comment.author_id != actor {
            return Err(LibError::forbidden(
                "Only the author can edit this comment",
                anyhow!("user {} is not the author of comment {}", actor, comment_id),
            ));
        }

        comment.content = normalize_name(&payload.content, "Comment content is required")?;
        comment.updated_at = Utc::now().naive_utc();
        self.store.upsert_comment(&comment).await?;
        self.emit_comment(CaseEventType::CommentUpdated, &comment, actor);
        Ok(comment)
    }

    /// Deletes a comment and its whole reply thread. Returns the removed ids.
    pub async fn delete_comment(&self, actor: UserId, comment_id: CommentId) -> Result<Vec<CommentId>> {
        let comment = self.load_comment(comment_id).await?;
        let (_, access) = permissions::require_case_permission(
            &*self.store,
            actor,
            comment.case_id,
            CASE_COMMENT_LEVEL,
        )
        .await?;
        if comment.author_id != actor && !access.allows(CASE_SHARE_LEVEL) {
            return Err(LibError::forbidden(
                "You do not have permission to delete this comment",
                anyhow!("user {} cannot delete comment {}", actor, comment_id),
            ));
        }

        let comments = self.store.list_comments(comment.case_id).await?;
        let thread = reply_thread(&comments, comment_id);
        self.store.delete_comments(&thread).await?;
        self.broadcaster.emit_event(
            CaseEventType::CommentDeleted,
            comment.case_id,
            json!({ "commentIds": thread }),
            Some(actor),
        );
        Ok(thread)
    }

    pub async fn resolve_comment(
        &self,
        actor: UserId,
        comment_id: CommentId,
        payload: ResolveCommentPayload,
    ) -> Result<Comment> {
        let mut comment = self.load_comment(comment_id).await?;
        permissions::require_case_permission(
            &*self.store,
            actor,
            comment.case_id,
            CASE_COMMENT_LEVEL,
        )
        .await?;

        let now = Utc::now().naive_utc();
        comment.resolved = payload.resolved;
        comment.resolved_by = payload.resolved.then_some(actor);
        comment.resolved_at = payload.resolved.then_some(now);
        comment.updated_at = now;
        self.store.upsert_comment(&comment).await?;
        self.emit_comment(CaseEventType::CommentUpdated, &comment, actor);
        Ok(comment)
    }

    pub async fn set_user_permission(
        &self,
        actor: UserId,
        case_id: CaseId,
        user_id: UserId,
        permission: Option<PermissionLevel>,
    ) -> Result<Option<PermissionLevel>> {
        let (case, _) =
            permissions::require_case_permission(&*self.store, actor, case_id, CASE_SHARE_LEVEL)
                .await?;
        if case.owner_user_id == user_id {
            return Err(LibError::invalid_with_code(
                "owner_permission_fixed",
                "The case owner always holds ADMIN",
                anyhow!("attempted to change owner grant on case {}", case_id),
            ));
        }

        self.store
            .set_user_permission(case_id, user_id, permission)
            .await?;
        self.broadcaster.emit_event(
            CaseEventType::PermissionChanged,
            case_id,
            json!({ "userId": user_id, "permission": permission }),
            Some(actor),
        );
        Ok(permission)
    }

    pub async fn set_team_permission(
        &self,
        actor: UserId,
        case_id: CaseId,
        team_id: TeamId,
        permission: Option<PermissionLevel>,
    ) -> Result<Option<PermissionLevel>> {
        permissions::require_case_permission(&*self.store, actor, case_id, CASE_SHARE_LEVEL)
            .await?;
        self.store
            .set_team_permission(case_id, team_id, permission)
            .await?;
        self.broadcaster.emit_event(
            CaseEventType::PermissionChanged,
            case_id,
            json!({ "teamId": team_id, "permission": permission }),
            Some(actor),
        );
        Ok(permission)
    }

    /// Takes the exclusive edit lock. Re-acquiring a lock you already hold returns it.
    pub async fn acquire_lock(&self, actor: UserId, case_id: CaseId) -> Result<EditLock> {
        let _guard = self.lock_case(case_id).await;
        let (mut case, _) =
            permissions::require_case_permission(&*self.store, actor, case_id, CASE_EDIT_LEVEL)
                .await?;
        if let Some(lock) = &case.edit_lock {
            if lock.holder == actor {
                return Ok(lock.clone());
            }
            return Err(locked_by_other(&case, lock));
        }

        let lock = EditLock {
            holder: actor,
            token: Uuid::new_v4(),
            acquired_at: Utc::now().naive_utc(),
        };
        case.edit_lock = Some(lock.clone());
        self.store.update_case(&case).await?;
        self.broadcaster.emit_event(
            CaseEventType::LockAcquired,
            case_id,
            json!({ "holder": actor }),
            Some(actor),
        );
        Ok(lock)
    }

    /// Releases the edit lock. Only its holder or a case ADMIN may release it.
    pub async fn release_lock(&self, actor: UserId, case_id: CaseId) -> Result<()> {
        let _guard = self.lock_case(case_id).await;
        let (mut case, access) =
            permissions::require_case_permission(&*self.store, actor, case_id, CASE_EDIT_LEVEL)
                .await?;
        let Some(lock) = case.edit_lock.take() else {
            return Ok(());
        };
        if lock.holder != actor && !access.allows(PermissionLevel::Admin) {
            return Err(LibError::forbidden(
                "Only the lock holder can release this lock",
                anyhow!("user {} cannot release lock held by {}", actor, lock.holder),
            ));
        }

        self.store.update_case(&case).await?;
        self.broadcaster.emit_event(
            CaseEventType::LockReleased,
            case_id,
            json!({ "holder": lock.holder }),
            Some(actor),
        );
        Ok(())
    }

    async fn load_state(&self, case: AssuranceCase) -> Result<CaseState> {
        let elements = self.store.list_elements(case.id).await?;
        let links = self.store.list_evidence_links(case.id).await?;
        Ok(CaseState {
            case,
            elements,
            links,
        })
    }

    /// Waits for the case's write guard. Idle guards are dropped from the map on the way in.
    async fn lock_case(&self, case_id: CaseId) -> OwnedMutexGuard<()> {
        let guard = {
            let mut guards = self
                .case_guards
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guards.retain(|id, guard| *id == case_id || Arc::strong_count(guard) > 1);
            Arc::clone(guards.entry(case_id).or_default())
        };
        guard.lock_owned().await
    }

    /// Locks the element's case, then reads permission, edit lock, and state under the guard.
    /// The element is re-read from that state since it may have changed while waiting.
    async fn load_for_edit(
        &self,
        actor: UserId,
        element_id: ElementId,
    ) -> Result<(OwnedMutexGuard<()>, CaseState, Element)> {
        let not_found = || {
            LibError::not_found(
                "Element not found",
                anyhow!("element {} not found", element_id),
            )
        };
        let case_id = self
            .store
            .get_element(element_id)
            .await?
            .ok_or_else(not_found)?
            .case_id;
        let guard = self.lock_case(case_id).await;
        let (case, _) =
            permissions::require_case_permission(&*self.store, actor, case_id, CASE_EDIT_LEVEL)
                .await?;
        ensure_unlocked(&case, actor)?;
        let state = self.load_state(case).await?;
        let element = state
            .elements
            .iter()
            .find(|element| element.id == element_id)
            .cloned()
            .ok_or_else(not_found)?;
        Ok((guard, state, element))
    }

    async fn load_element_in_case(&self, case_id: CaseId, element_id: ElementId) -> Result<Element> {
        match self.store.get_element(element_id).await? {
            Some(element) if element.case_id == case_id => Ok(element),
            _ => Err(LibError::not_found(
                "Element not found",
                anyhow!("element {} not found in case {}", element_id, case_id),
            )),
        }
    }

    async fn load_comment(&self, comment_id: CommentId) -> Result<Comment> {
        self.store.get_comment(comment_id).await?.ok_or_else(|| {
            LibError::not_found(
                "Comment not found",
                anyhow!("comment {} not found", comment_id),
            )
        })
    }

    /// Validates the post-write case, persists it, broadcasts, and rebuilds the snapshot.
    async fn commit(
        &self,
        actor: UserId,
        state: CaseState,
        write: CaseWrite,
        event_type: CaseEventType,
        payload: Value,
    ) -> Result<CaseSnapshot> {
        let case_id = state.case.id;
        let (elements, links) = write.preview(&state.elements, &state.links);
        ensure_case_invariants(case_id, &elements, &links)?;
        let tree = build_tree_from_elements(&elements, &links)?;

        self.store.apply(case_id, &write).await?;
        self.broadcaster
            .emit_event(event_type, case_id, payload, Some(actor));

        let case = self.reload_case(state.case).await;
        Ok(CaseSnapshot {
            case,
            tree: tree.root,
            root_inferred: tree.root_inferred,
            orphaned_elements: orphaned_nodes(&elements),
        })
    }

    /// Re-reads the case record after a committed write. The write already happened, so a
    /// failed read falls back to the record loaded before it.
    async fn reload_case(&self, loaded: AssuranceCase) -> AssuranceCase {
        match permissions::load_case(&*self.store, loaded.id).await {
            Ok(case) => case,
            Err(err) => {
                tracing::warn!(
                    case_id = %loaded.id,
                    error = %err,
                    "case reload failed after commit; returning pre-write record"
                );
                AssuranceCase {
                    updated_at: Utc::now().naive_utc(),
                    ..loaded
                }
            }
        }
    }

    fn emit_comment(&self, event_type: CaseEventType, comment: &Comment, actor: UserId) {
        let payload = serde_json::to_value(comment).unwrap_or_else(|_| json!({ "commentId": comment.id }));
        self.broadcaster
            .emit_event(event_type, comment.case_id, payload, Some(actor));
    }
}

#[derive(Debug)]
struct CaseState {
    case: AssuranceCase,
    elements: Vec<Element>,
    links: Vec<EvidenceLink>,
}

fn snapshot_from(
    case: AssuranceCase,
    elements: &[Element],
    links: &[EvidenceLink],
) -> Result<CaseSnapshot> {
    let tree = build_tree_from_elements(elements, links)?;
    Ok(CaseSnapshot {
        case,
        tree: tree.root,
        root_inferred: tree.root_inferred,
        orphaned_elements: orphaned_nodes(elements),
    })
}

/// Detached elements, once each, in storage order.
fn orphaned_nodes(elements: &[Element]) -> Vec<TreeNode> {
    let mut seen = HashSet::new();
    elements
        .iter()
        .filter(|element| element.in_sandbox && seen.insert(element.id))
        .map(TreeNode::leaf)
        .collect()
}

fn ensure_unlocked(case: &AssuranceCase, actor: UserId) -> Result<()> {
    match &case.edit_lock {
        Some(lock) if lock.holder != actor => Err(locked_by_other(case, lock)),
        _ => Ok(()),
    }
}

fn locked_by_other(case: &AssuranceCase, lock: &EditLock) -> LibError {
    LibError::conflict_with_code(
        "case_locked",
        "Case is locked for editing by another user",
        anyhow!("case {} is locked by {}", case.id, lock.holder),
    )
}

fn reply_thread(comments: &[Comment], root: CommentId) -> Vec<CommentId> {
    let mut thread = vec![root];
    let mut index = 0;
    while index < thread.len() {
        let parent = thread[index];
        for comment in comments {
            if comment.parent_comment_id == Some(parent) && !thread.contains(&comment.id) {
                thread.push(comment.id);
            }
        }
        index += 1;
    }
    thread
}

fn find_element(elements: &[Element], element_id: ElementId) -> Result<&Element> {
    elements
        .iter()
        .find(|element| element.id == element_id)
        .ok_or_else(|| {
            LibError::not_found(
                "Element not found",
                anyhow!("element {} not found in case", element_id),
            )
        })
}

/// Resolves an explicit structural destination and checks it is live and of the named kind.
fn resolve_target(elements: &[Element], target: MoveTarget) -> Result<&Element> {
    let destination = find_element(elements, target.id())?;
    if destination.kind != target.kind() {
        return Err(LibError::invalid_with_code(
            "target_kind_mismatch",
            "Target element is not of the requested kind",
            anyhow!(
                "target {} is {}, not {}",
                destination.id,
                destination.kind.as_db_value(),
                target.kind().as_db_value()
            ),
        ));
    }
    if destination.in_sandbox {
        return Err(LibError::conflict_with_code(
            "target_detached",
            "Target element is detached from the argument",
            anyhow!("target {} is in the sandbox", destination.id),
        ));
    }
    Ok(destination)
}

fn invalid_placement(kind: ElementKind, target: MoveTarget) -> LibError {
    LibError::invalid_with_code(
        "invalid_move_target",
        "Element kind cannot be placed under this target",
        anyhow!(
            "{} cannot be placed under {}",
            kind.as_db_value(),
            target.kind().as_db_value()
        ),
    )
}

fn resolve_claims(elements: &[Element], claim_ids: &[ElementId]) -> Result<Vec<ElementId>> {
    let claim_ids = normalize_claim_ids(claim_ids)?;
    for claim_id in &claim_ids {
        resolve_target(elements, MoveTarget::PropertyClaim(*claim_id))?;
    }
    Ok(claim_ids)
}

pub(crate) fn plan_create(
    elements: &[Element],
    links: &[EvidenceLink],
    case_id: CaseId,
    payload: CreateElementPayload,
    now: NaiveDateTime,
) -> Result<(CaseWrite, Element)> {
    if payload.kind == ElementKind::Goal {
        return Err(LibError::invalid_with_code(
            "invalid_element_kind",
            "A case has exactly one goal",
            anyhow!("attempted to create a second goal in case {}", case_id),
        ));
    }
    payload.attributes.ensure_applicable(payload.kind)?;
    if let Some(defeated) = payload.defeats_element_id {
        find_element(elements, defeated)?;
    }

    let mut element = Element::new(
        case_id,
        payload.kind,
        next_label(elements, payload.kind)?,
        None,
        now,
    );
    element.description = payload.description.unwrap_or_default();
    element.attributes = payload.attributes;
    element.is_defeater = payload.is_defeater;
    element.defeats_element_id = payload.defeats_element_id;

    let mut write = CaseWrite::default();
    let mut claim_ids = payload.claim_ids;
    match (payload.kind, payload.parent) {
        (ElementKind::Evidence, Some(MoveTarget::PropertyClaim(claim_id))) => claim_ids.insert(0, claim_id),
        (kind, Some(target)) if kind != ElementKind::Evidence => {
            if !claim_ids.is_empty() {
                return Err(LibError::invalid(
                    "Only evidence can be linked to claims",
                    anyhow!("{} created with claim ids", kind.as_db_value()),
                ));
            }
            if !placement_allowed(kind, target) {
                return Err(invalid_placement(kind, target));
            }
            let destination = resolve_target(elements, target)?;
            element.parent_id = Some(destination.id);
            element.hidden = sibling_hidden(elements, links, destination.id, element.id);
        }
        (kind, Some(target)) => return Err(invalid_placement(kind, target)),
        (ElementKind::Evidence, None) => {}
        (kind, None) => {
            if !claim_ids.is_empty() {
                return Err(LibError::invalid(
                    "Only evidence can be linked to claims",
                    anyhow!("{} created with claim ids", kind.as_db_value()),
                ));
            }
        }
    }

    if element.kind == ElementKind::Evidence && !claim_ids.is_empty() {
        let claim_ids = resolve_claims(elements, &claim_ids)?;
        element.hidden = sibling_hidden(elements, links, claim_ids[0], element.id);
        write.add_links.extend(claim_ids.iter().map(|claim_id| EvidenceLink {
            evidence_id: element.id,
            property_claim_id: *claim_id,
        }));
    } else if element.parent_id.is_none() {
        element.in_sandbox = true;
    }

    write.upsert(element.clone());
    Ok((write, element))
}

pub(crate) fn plan_move(
    elements: &[Element],
    links: &[EvidenceLink],
    element: &Element,
    target: MoveTarget,
) -> Result<CaseWrite> {
    if element.is_root_goal() {
        return Err(LibError::conflict_with_code(
            "cannot_move_root",
            "The root goal cannot be moved",
            anyhow!("attempted to move root {}", element.id),
        ));
    }
    if !placement_allowed(element.kind, target) {
        return Err(invalid_placement(element.kind, target));
    }
    let destination = resolve_target(elements, target)?;
    if destination.id == element.id || algorithms::is_descendant(elements, element.id, destination.id)
    {
        return Err(LibError::conflict_with_code(
            "move_into_descendant",
            "An element cannot be moved under itself",
            anyhow!("{} is inside the subtree of {}", destination.id, element.id),
        ));
    }

    let mut moved = element.clone();
    moved.in_sandbox = false;
    moved.hidden = sibling_hidden(elements, links, destination.id, element.id);

    let mut write = CaseWrite::default();
    if element.kind == ElementKind::Evidence {
        moved.parent_id = None;
        write.remove_links.extend(
            links
                .iter()
                .filter(|link| link.evidence_id == element.id)
                .copied(),
        );
        write.add_links.push(EvidenceLink {
            evidence_id: element.id,
            property_claim_id: destination.id,
        });
    } else {
        moved.parent_id = Some(destination.id);
    }
    write.upsert(moved);
    Ok(write)
}

/// Links evidence to more claims, or with `replace` swaps its whole link set.
pub(crate) fn plan_attach(
    elements: &[Element],
    links: &[EvidenceLink],
    evidence: &Element,
    claim_ids: &[ElementId],
    replace: bool,
) -> Result<CaseWrite> {
    if evidence.kind != ElementKind::Evidence {
        return Err(LibError::invalid_with_code(
            "attach_requires_evidence",
            "Only evidence can be attached to claims",
            anyhow!("{} is {}", evidence.id, evidence.kind.as_db_value()),
        ));
    }
    let claim_ids = resolve_claims(elements, claim_ids)?;

    let mut write = CaseWrite::default();
    let existing = links
        .iter()
        .filter(|link| link.evidence_id == evidence.id)
        .copied()
        .collect::<Vec<_>>();
    if replace {
        write.remove_links.extend(
            existing
                .iter()
                .filter(|link| !claim_ids.contains(&link.property_claim_id))
                .copied(),
        );
    }
    write.add_links.extend(
        claim_ids
            .iter()
            .map(|claim_id| EvidenceLink {
                evidence_id: evidence.id,
                property_claim_id: *claim_id,
            })
            .filter(|link| !existing.contains(link)),
    );

    let mut attached = evidence.clone();
    attached.in_sandbox = false;
    attached.parent_id = None;
    attached.hidden = sibling_hidden(elements, links, claim_ids[0], evidence.id);
    write.upsert(attached);
    Ok(write)
}

/// Sandboxes the element with its structural subtree and every evidence item
/// linked to a detached claim.
pub(crate) fn plan_detach(
    elements: &[Element],
    links: &[EvidenceLink],
    element: &Element,
) -> Result<CaseWrite> {
    if element.is_root_goal() {
        return Err(LibError::conflict_with_code(
            "cannot_detach_root",
            "The root goal cannot be detached",
            anyhow!("attempted to detach root {}", element.id),
        ));
    }
    if element.in_sandbox {
        return Err(LibError::invalid_with_code(
            "element_already_detached",
            "Element is already detached",
            anyhow!("element {} is already in the sandbox", element.id),
        ));
    }

    let mut detached = algorithms::descendant_ids(elements, element.id);
    let claims = detached.clone();
    for evidence_id in algorithms::linked_evidence_ids(elements, links, &claims) {
        if !detached.contains(&evidence_id) {
            detached.push(evidence_id);
        }
    }
    let detached_set: HashSet<ElementId> = detached.iter().copied().collect();

    let mut write = CaseWrite::default();
    write.remove_links.extend(
        links
            .iter()
            .filter(|link| {
                detached_set.contains(&link.evidence_id)
                    || detached_set.contains(&link.property_claim_id)
            })
            .copied(),
    );
    for id in detached {
        let mut orphan = find_element(elements, id)?.clone();
        orphan.parent_id = None;
        orphan.in_sandbox = true;
        write.upsert(orphan);
    }
    Ok(write)
}

/// Deletes the element and its structural subtree. Evidence that loses its last
/// claim is sandboxed, never deleted.
pub(crate) fn plan_delete(
    elements: &[Element],
    links: &[EvidenceLink],
    element: &Element,
) -> Result<CaseWrite> {
    if element.is_root_goal() {
        return Err(LibError::conflict_with_code(
            "cannot_delete_root",
            "The root goal cannot be deleted",
            anyhow!("attempted to delete root {}", element.id),
        ));
    }

    let deleted = algorithms::descendant_ids(elements, element.id);
    let deleted_set: HashSet<ElementId> = deleted.iter().copied().collect();

    let mut write = CaseWrite {
        delete_elements: deleted.clone(),
        ..CaseWrite::default()
    };
    for survivor in elements.iter().filter(|element| !deleted_set.contains(&element.id)) {
        if survivor
            .defeats_element_id
            .is_some_and(|defeated| deleted_set.contains(&defeated))
        {
            let mut cleared = survivor.clone();
            cleared.defeats_element_id = None;
            write.upsert(cleared);
        }
    }
    for evidence_id in algorithms::linked_evidence_ids(elements, links, &deleted) {
        if deleted_set.contains(&evidence_id) {
            continue;
        }
        let still_linked = links.iter().any(|link| {
            link.evidence_id == evidence_id && !deleted_set.contains(&link.property_claim_id)
        });
        if !still_linked {
            let mut orphan = match write
                .upsert_elements
                .iter()
                .find(|pending| pending.id == evidence_id)
            {
                Some(pending) => pending.clone(),
                None => find_element(elements, evidence_id)?.clone(),
            };
            orphan.in_sandbox = true;
            orphan.parent_id = None;
            write.upsert(orphan);
        }
    }
    Ok(write)
}

pub(crate) fn plan_update(
    elements: &[Element],
    links: &[EvidenceLink],
    element: &Element,
    payload: UpdateElementPayload,
) -> Result<CaseWrite> {
    let mut write = match (payload.target, payload.claim_ids.as_deref()) {
        (Some(_), Some(_)) => {
            return Err(LibError::invalid(
                "Provide either a target or a claim id set, not both",
                anyhow!("update for {} carried target and claim ids", element.id),
            ));
        }
        (Some(target), None) => plan_move(elements, links, element, target)?,
        (None, Some(claim_ids)) => plan_attach(elements, links, element, claim_ids, true)?,
        (None, None) => CaseWrite::default(),
    };
    let relocated = !write.upsert_elements.is_empty();

    let mut updated = write
        .upsert_elements
        .iter()
        .find(|pending| pending.id == element.id)
        .cloned()
        .unwrap_or_else(|| element.clone());
    if let Some(name) = payload.name {
        updated.name = normalize_name(&name, "Element name is required")?;
    }
    if let Some(description) = payload.description {
        updated.description = description;
    }
    if let Some(attributes) = payload.attributes {
        attributes.ensure_applicable(updated.kind)?;
        updated.attributes.merge(attributes);
    }
    if let Some(hidden) = payload.hidden {
        if !relocated {
            updated.hidden = hidden;
        }
    }
    if updated.from_pattern && updated != *element {
        updated.modified_from_pattern = true;
    }
    write.upsert(updated);
    Ok(write)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::events::CaseEvent;
    use crate::models::ElementAttributes;
    use crate::store::MemoryStore;

    struct Fixture {
        ops: CaseOperations<MemoryStore>,
        store: Arc<MemoryStore>,
        broadcaster: Arc<Broadcaster>,
        owner: UserId,
        case_id: CaseId,
        root: ElementId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(Broadcaster::new());
        let ops = CaseOperations::new(Arc::clone(&store), Arc::clone(&broadcaster));
        let owner = UserId::new_v4();
        let snapshot = ops
            .create_case(
                owner,
                CreateCasePayload {
                    name: "Infusion pump".to_string(),
                    description: None,
                    goal_description: Some("Pump is acceptably safe".to_string()),
                },
            )
            .await
            .expect("create case");
        Fixture {
            ops,
            store,
            broadcaster,
            owner,
            case_id: snapshot.case.id,
            root: snapshot.tree.id,
        }
    }

    fn create(kind: ElementKind, parent: Option<MoveTarget>) -> CreateElementPayload {
        CreateElementPayload {
            kind,
            parent,
            claim_ids: Vec::new(),
            description: None,
            attributes: ElementAttributes::default(),
            is_defeater: false,
            defeats_element_id: None,
        }
    }

    fn evidence_for(claims: &[ElementId]) -> CreateElementPayload {
        CreateElementPayload {
            claim_ids: claims.to_vec(),
            ..create(ElementKind::Evidence, None)
        }
    }

    fn named(snapshot: &CaseSnapshot, name: &str) -> ElementId {
        fn walk(node: &TreeNode, name: &str) -> Option<ElementId> {
            if node.name == name {
                return Some(node.id);
            }
            node.children.iter().find_map(|child| walk(child, name))
        }
        walk(&snapshot.tree, name)
            .or_else(|| snapshot.orphaned_elements.iter().find_map(|node| walk(node, name)))
            .unwrap_or_else(|| panic!("no element named {name}"))
    }

    /// G1 -> S1 -> P1 -> E1, with P2 under G1.
    async fn seed_argument(fx: &Fixture) -> CaseSnapshot {
        let snapshot = fx
            .ops
            .create_element(
                fx.owner,
                fx.case_id,
                create(ElementKind::Strategy, Some(MoveTarget::Goal(fx.root))),
            )
            .await
            .expect("S1");
        let s1 = named(&snapshot, "S1");
        let snapshot = fx
            .ops
            .create_element(
                fx.owner,
                fx.case_id,
                create(ElementKind::PropertyClaim, Some(MoveTarget::Strategy(s1))),
            )
            .await
            .expect("P1");
        let p1 = named(&snapshot, "P1");
        fx.ops
            .create_element(fx.owner, fx.case_id, evidence_for(&[p1]))
            .await
            .expect("E1");
        fx.ops
            .create_element(
                fx.owner,
                fx.case_id,
                create(ElementKind::PropertyClaim, Some(MoveTarget::Goal(fx.root))),
            )
            .await
            .expect("P2")
    }

    fn listen(fx: &Fixture, user: UserId) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(16);
        fx.broadcaster.add_connection(fx.case_id, user, tx);
        rx
    }

    fn next_event(rx: &mut mpsc::Receiver<Bytes>) -> Option<CaseEvent> {
        let frame = rx.try_recv().ok()?;
        let text = String::from_utf8(frame.to_vec()).expect("utf8");
        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .expect("data line");
        Some(serde_json::from_str(data).expect("event json"))
    }

    #[tokio::test]
    async fn created_elements_get_labels_and_shape() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;

        let s1 = &snapshot.tree.children[0];
        assert_eq!(s1.name, "S1");
        assert_eq!(s1.kind(), ElementKind::Strategy);
        let p1 = &s1.children[0];
        assert_eq!(p1.name, "P1");
        assert_eq!(p1.children[0].name, "E1");
        assert_eq!(p1.children[0].kind(), ElementKind::Evidence);
        assert_eq!(snapshot.tree.children[1].name, "P2");
        assert!(snapshot.orphaned_elements.is_empty());
    }

    #[tokio::test]
    async fn comment_only_user_cannot_move_and_nothing_is_written() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let p2 = named(&snapshot, "P2");
        let s1 = named(&snapshot, "S1");

        let commenter = UserId::new_v4();
        fx.ops
            .set_user_permission(fx.owner, fx.case_id, commenter, Some(PermissionLevel::Comment))
            .await
            .expect("grant");
        let mut rx = listen(&fx, fx.owner);
        let writes = fx.store.write_count();

        let err = fx
            .ops
            .move_element(commenter, p2, MoveTarget::Strategy(s1))
            .await
            .expect_err("comment level cannot move");
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert_eq!(fx.store.write_count(), writes);
        assert!(next_event(&mut rx).is_none());
    }

    #[tokio::test]
    async fn store_failure_emits_no_event() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let p2 = named(&snapshot, "P2");
        let s1 = named(&snapshot, "S1");
        let mut rx = listen(&fx, UserId::new_v4());

        fx.store.fail_writes(true);
        let err = fx
            .ops
            .move_element(fx.owner, p2, MoveTarget::Strategy(s1))
            .await
            .expect_err("store down");
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(next_event(&mut rx).is_none());

        fx.store.fail_writes(false);
        let snapshot = fx.ops.get_case(fx.owner, fx.case_id).await.expect("read");
        assert_eq!(snapshot.tree.children[1].id, p2);
    }

    #[tokio::test]
    async fn move_takes_visibility_from_new_siblings() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let s1 = named(&snapshot, "S1");
        let p1 = named(&snapshot, "P1");
        let p2 = named(&snapshot, "P2");

        fx.ops
            .update_element(
                fx.owner,
                p1,
                UpdateElementPayload {
                    hidden: Some(true),
                    ..UpdateElementPayload::default()
                },
            )
            .await
            .expect("hide P1");

        let snapshot = fx
            .ops
            .move_element(fx.owner, p2, MoveTarget::Strategy(s1))
            .await
            .expect("move");
        let strategy = snapshot.tree.find(s1).expect("S1");
        assert_eq!(
            strategy.children.iter().map(|child| child.id).collect::<Vec<_>>(),
            vec![p1, p2]
        );
        assert!(strategy.find(p2).expect("P2").hidden);

        let stored = fx.store.get_element(p2).await.expect("get").expect("P2");
        assert_eq!(stored.parent_id, Some(s1));
        assert!(stored.hidden);
    }

    #[tokio::test]
    async fn move_under_visible_evidence_unhides() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let p1 = named(&snapshot, "P1");
        let p2 = named(&snapshot, "P2");
        fx.ops
            .update_element(
                fx.owner,
                p2,
                UpdateElementPayload {
                    hidden: Some(true),
                    ..UpdateElementPayload::default()
                },
            )
            .await
            .expect("hide P2");

        let snapshot = fx
            .ops
            .move_element(fx.owner, p2, MoveTarget::PropertyClaim(p1))
            .await
            .expect("move under claim");
        assert!(!snapshot.tree.find(p2).expect("P2").hidden);
    }

    #[tokio::test]
    async fn invalid_moves_are_rejected() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let s1 = named(&snapshot, "S1");
        let p1 = named(&snapshot, "P1");
        let e1 = named(&snapshot, "E1");

        let err = fx
            .ops
            .move_element(fx.owner, s1, MoveTarget::PropertyClaim(p1))
            .await
            .expect_err("strategy under claim");
        assert_eq!(err.code, "invalid_move_target");

        let err = fx
            .ops
            .move_element(fx.owner, e1, MoveTarget::Strategy(s1))
            .await
            .expect_err("evidence under strategy");
        assert_eq!(err.code, "invalid_move_target");

        let err = fx
            .ops
            .move_element(fx.owner, p1, MoveTarget::Goal(s1))
            .await
            .expect_err("mislabelled target");
        assert_eq!(err.code, "target_kind_mismatch");

        let err = fx
            .ops
            .move_element(fx.owner, fx.root, MoveTarget::Strategy(s1))
            .await
            .expect_err("root");
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn claim_cannot_move_into_its_own_subtree() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let p1 = named(&snapshot, "P1");
        let snapshot = fx
            .ops
            .create_element(
                fx.owner,
                fx.case_id,
                create(ElementKind::PropertyClaim, Some(MoveTarget::PropertyClaim(p1))),
            )
            .await
            .expect("P3");
        let p3 = named(&snapshot, "P3");

        let err = fx
            .ops
            .move_element(fx.owner, p1, MoveTarget::PropertyClaim(p3))
            .await
            .expect_err("cycle");
        assert_eq!(err.code, "move_into_descendant");
    }

    #[tokio::test]
    async fn detach_orphans_whole_claim_subtree_and_evidence() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let p1 = named(&snapshot, "P1");
        let e1 = named(&snapshot, "E1");
        let snapshot = fx
            .ops
            .create_element(
                fx.owner,
                fx.case_id,
                create(ElementKind::PropertyClaim, Some(MoveTarget::PropertyClaim(p1))),
            )
            .await
            .expect("P3");
        let p3 = named(&snapshot, "P3");
        let snapshot = fx
            .ops
            .create_element(fx.owner, fx.case_id, evidence_for(&[p3]))
            .await
            .expect("E2");
        let e2 = named(&snapshot, "E2");

        let snapshot = fx.ops.detach_element(fx.owner, p1).await.expect("detach");
        for id in [p1, p3, e1, e2] {
            assert!(snapshot.tree.find(id).is_none(), "{id} still in tree");
            let stored = fx.store.get_element(id).await.expect("get").expect("row");
            assert!(stored.in_sandbox);
            assert_eq!(stored.parent_id, None);
        }
        let mut orphans = snapshot
            .orphaned_elements
            .iter()
            .map(|node| node.id)
            .collect::<Vec<_>>();
        orphans.sort();
        let mut expected = vec![p1, p3, e1, e2];
        expected.sort();
        assert_eq!(orphans, expected);
        assert!(
            fx.store
                .list_evidence_links(fx.case_id)
                .await
                .expect("links")
                .is_empty()
        );

        let err = fx.ops.detach_element(fx.owner, p1).await.expect_err("twice");
        assert_eq!(err.code, "element_already_detached");
    }

    #[tokio::test]
    async fn detached_claim_can_be_reattached() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let p2 = named(&snapshot, "P2");
        let s1 = named(&snapshot, "S1");
        fx.ops.detach_element(fx.owner, p2).await.expect("detach");

        let snapshot = fx
            .ops
            .move_element(fx.owner, p2, MoveTarget::Strategy(s1))
            .await
            .expect("reattach");
        assert!(snapshot.tree.find(s1).expect("S1").find(p2).is_some());
        assert!(snapshot.orphaned_elements.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_subtree_and_keeps_shared_evidence() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let s1 = named(&snapshot, "S1");
        let p1 = named(&snapshot, "P1");
        let p2 = named(&snapshot, "P2");
        let e1 = named(&snapshot, "E1");
        fx.ops
            .attach_evidence(
                fx.owner,
                e1,
                AttachEvidencePayload {
                    claim_ids: vec![p2],
                },
            )
            .await
            .expect("share E1");
        let mut rx = listen(&fx, UserId::new_v4());

        let snapshot = fx.ops.delete_element(fx.owner, s1).await.expect("delete");
        assert!(snapshot.tree.find(s1).is_none());
        assert!(snapshot.tree.find(p1).is_none());
        assert_eq!(snapshot.tree.find(p2).expect("P2").children[0].id, e1);
        assert!(fx.store.get_element(p1).await.expect("get").is_none());
        assert!(fx.store.get_element(e1).await.expect("get").is_some());

        let event = next_event(&mut rx).expect("delete event");
        assert_eq!(event.event_type, CaseEventType::ElementDeleted);
        assert_eq!(event.user_id, Some(fx.owner));
    }

    #[tokio::test]
    async fn delete_sandboxes_evidence_left_without_claims() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let p1 = named(&snapshot, "P1");
        let e1 = named(&snapshot, "E1");

        let snapshot = fx.ops.delete_element(fx.owner, p1).await.expect("delete");
        assert_eq!(
            snapshot
                .orphaned_elements
                .iter()
                .map(|node| node.id)
                .collect::<Vec<_>>(),
            vec![e1]
        );
        let err = fx
            .ops
            .delete_element(fx.owner, fx.root)
            .await
            .expect_err("root");
        assert_eq!(err.code, "cannot_delete_root");
    }

    #[tokio::test]
    async fn attach_links_evidence_under_both_claims() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let p1 = named(&snapshot, "P1");
        let p2 = named(&snapshot, "P2");
        let e1 = named(&snapshot, "E1");
        let observer = UserId::new_v4();
        let mut rx = listen(&fx, observer);
        let mut own = listen(&fx, fx.owner);

        let snapshot = fx
            .ops
            .attach_evidence(
                fx.owner,
                e1,
                AttachEvidencePayload {
                    claim_ids: vec![p2, p2],
                },
            )
            .await
            .expect("attach");
        assert_eq!(snapshot.tree.find(p1).expect("P1").children[0].id, e1);
        assert_eq!(snapshot.tree.find(p2).expect("P2").children[0].id, e1);

        let event = next_event(&mut rx).expect("observer sees attach");
        assert_eq!(event.event_type, CaseEventType::ElementAttached);
        assert_eq!(event.case_id, fx.case_id);
        assert!(next_event(&mut own).is_none());

        let err = fx
            .ops
            .attach_evidence(fx.owner, p1, AttachEvidencePayload { claim_ids: vec![p2] })
            .await
            .expect_err("claims are not evidence");
        assert_eq!(err.code, "attach_requires_evidence");
    }

    #[tokio::test]
    async fn update_replaces_evidence_links() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let p1 = named(&snapshot, "P1");
        let p2 = named(&snapshot, "P2");
        let e1 = named(&snapshot, "E1");

        let snapshot = fx
            .ops
            .update_element(
                fx.owner,
                e1,
                UpdateElementPayload {
                    claim_ids: Some(vec![p2]),
                    ..UpdateElementPayload::default()
                },
            )
            .await
            .expect("relink");
        assert!(snapshot.tree.find(p1).expect("P1").children.is_empty());
        assert_eq!(snapshot.tree.find(p2).expect("P2").children[0].id, e1);
    }

    #[tokio::test]
    async fn update_rejects_inapplicable_attributes() {
        let fx = fixture().await;
        let err = fx
            .ops
            .update_element(
                fx.owner,
                fx.root,
                UpdateElementPayload {
                    attributes: Some(ElementAttributes {
                        level: Some(3),
                        ..ElementAttributes::default()
                    }),
                    ..UpdateElementPayload::default()
                },
            )
            .await
            .expect_err("level is claim-only");
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let snapshot = fx
            .ops
            .update_element(
                fx.owner,
                fx.root,
                UpdateElementPayload {
                    name: Some(" Top goal ".to_string()),
                    attributes: Some(ElementAttributes {
                        context: Some(vec!["Ward use only".to_string()]),
                        ..ElementAttributes::default()
                    }),
                    ..UpdateElementPayload::default()
                },
            )
            .await
            .expect("update root");
        assert_eq!(snapshot.tree.name, "Top goal");
        let value = serde_json::to_value(&snapshot.tree).expect("json");
        assert_eq!(value["context"], json!(["Ward use only"]));
    }

    #[tokio::test]
    async fn unparented_element_lands_in_sandbox() {
        let fx = fixture().await;
        let snapshot = fx
            .ops
            .create_element(fx.owner, fx.case_id, create(ElementKind::PropertyClaim, None))
            .await
            .expect("create");
        assert_eq!(snapshot.orphaned_elements.len(), 1);
        assert!(snapshot.tree.children.is_empty());

        let err = fx
            .ops
            .create_element(fx.owner, fx.case_id, create(ElementKind::Goal, None))
            .await
            .expect_err("second goal");
        assert_eq!(err.code, "invalid_element_kind");
    }

    #[tokio::test]
    async fn edit_lock_blocks_other_editors() {
        let fx = fixture().await;
        let editor = UserId::new_v4();
        fx.ops
            .set_user_permission(fx.owner, fx.case_id, editor, Some(PermissionLevel::Edit))
            .await
            .expect("grant");

        let lock = fx.ops.acquire_lock(editor, fx.case_id).await.expect("lock");
        assert_eq!(lock.holder, editor);
        assert_eq!(
            fx.ops.acquire_lock(editor, fx.case_id).await.expect("again").token,
            lock.token
        );

        let err = fx
            .ops
            .create_element(
                fx.owner,
                fx.case_id,
                create(ElementKind::Strategy, Some(MoveTarget::Goal(fx.root))),
            )
            .await
            .expect_err("locked");
        assert_eq!(err.code, "case_locked");
        fx.ops
            .create_element(
                editor,
                fx.case_id,
                create(ElementKind::Strategy, Some(MoveTarget::Goal(fx.root))),
            )
            .await
            .expect("holder edits");

        fx.ops.release_lock(fx.owner, fx.case_id).await.expect("admin releases");
        fx.ops
            .create_element(
                fx.owner,
                fx.case_id,
                create(ElementKind::Strategy, Some(MoveTarget::Goal(fx.root))),
            )
            .await
            .expect("unlocked");
    }

    #[tokio::test]
    async fn non_holder_editor_cannot_release_lock() {
        let fx = fixture().await;
        let editor = UserId::new_v4();
        fx.ops
            .set_user_permission(fx.owner, fx.case_id, editor, Some(PermissionLevel::Edit))
            .await
            .expect("grant");
        fx.ops.acquire_lock(fx.owner, fx.case_id).await.expect("lock");

        let err = fx
            .ops
            .release_lock(editor, fx.case_id)
            .await
            .expect_err("not holder");
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn owner_grant_cannot_be_changed() {
        let fx = fixture().await;
        let err = fx
            .ops
            .set_user_permission(fx.owner, fx.case_id, fx.owner, Some(PermissionLevel::View))
            .await
            .expect_err("owner");
        assert_eq!(err.code, "owner_permission_fixed");
    }

    #[tokio::test]
    async fn comment_threads_delete_together() {
        let fx = fixture().await;
        let reviewer = UserId::new_v4();
        fx.ops
            .set_user_permission(fx.owner, fx.case_id, reviewer, Some(PermissionLevel::Comment))
            .await
            .expect("grant");

        let top = fx
            .ops
            .create_comment(
                reviewer,
                fx.case_id,
                CreateCommentPayload {
                    element_id: Some(fx.root),
                    parent_comment_id: None,
                    content: "Is the hazard log linked?".to_string(),
                },
            )
            .await
            .expect("comment");
        let reply = fx
            .ops
            .create_comment(
                fx.owner,
                fx.case_id,
                CreateCommentPayload {
                    element_id: Some(fx.root),
                    parent_comment_id: Some(top.id),
                    content: "Added in E3".to_string(),
                },
            )
            .await
            .expect("reply");

        let err = fx
            .ops
            .update_comment(
                fx.owner,
                top.id,
                UpdateCommentPayload {
                    content: "edited".to_string(),
                },
            )
            .await
            .expect_err("not author");
        assert_eq!(err.kind, ErrorKind::Forbidden);

        let resolved = fx
            .ops
            .resolve_comment(reviewer, top.id, ResolveCommentPayload { resolved: true })
            .await
            .expect("resolve");
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_by, Some(reviewer));

        let removed = fx.ops.delete_comment(fx.owner, top.id).await.expect("admin deletes");
        assert_eq!(removed, vec![top.id, reply.id]);
        assert!(fx.ops.list_comments(reviewer, fx.case_id).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn viewer_cannot_comment() {
        let fx = fixture().await;
        let viewer = UserId::new_v4();
        fx.ops
            .set_user_permission(fx.owner, fx.case_id, viewer, Some(PermissionLevel::View))
            .await
            .expect("grant");
        let err = fx
            .ops
            .create_comment(
                viewer,
                fx.case_id,
                CreateCommentPayload {
                    element_id: None,
                    parent_comment_id: None,
                    content: "hi".to_string(),
                },
            )
            .await
            .expect_err("view only");
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert!(fx.ops.get_case(viewer, fx.case_id).await.is_ok());
    }

    #[tokio::test]
    async fn execute_dispatches_tagged_operations() {
        let fx = fixture().await;
        let operation: CaseOperation = serde_json::from_value(json!({
            "operation": "case_access",
            "case_id": fx.case_id,
        }))
        .expect("operation");
        let result = fx.ops.execute(fx.owner, operation).await.expect("execute");
        let value = serde_json::to_value(&result).expect("json");
        assert_eq!(value["result"], json!("access"));
        assert_eq!(value["access"]["isOwner"], json!(true));
    }

    /// Delegates to a [`MemoryStore`] but yields before every call, so operations
    /// joined on one task interleave at each store await.
    #[derive(Debug)]
    struct YieldingStore {
        inner: MemoryStore,
        applied: AtomicBool,
        refuse_case_reads_after_apply: AtomicBool,
    }

    impl YieldingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                applied: AtomicBool::new(false),
                refuse_case_reads_after_apply: AtomicBool::new(false),
            }
        }
    }

    impl CaseStore for YieldingStore {
        async fn get_case(&self, case_id: CaseId) -> Result<Option<AssuranceCase>> {
            tokio::task::yield_now().await;
            if self.refuse_case_reads_after_apply.load(Ordering::SeqCst)
                && self.applied.load(Ordering::SeqCst)
            {
                return Err(LibError::database(
                    "Failed to load case",
                    anyhow!("read of case {} refused", case_id),
                ));
            }
            self.inner.get_case(case_id).await
        }

        async fn insert_case(&self, case: &AssuranceCase, root: &Element) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.insert_case(case, root).await
        }

        async fn update_case(&self, case: &AssuranceCase) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.update_case(case).await
        }

        async fn list_elements(&self, case_id: CaseId) -> Result<Vec<Element>> {
            tokio::task::yield_now().await;
            self.inner.list_elements(case_id).await
        }

        async fn list_evidence_links(&self, case_id: CaseId) -> Result<Vec<EvidenceLink>> {
            tokio::task::yield_now().await;
            self.inner.list_evidence_links(case_id).await
        }

        async fn get_element(&self, element_id: ElementId) -> Result<Option<Element>> {
            tokio::task::yield_now().await;
            self.inner.get_element(element_id).await
        }

        async fn apply(&self, case_id: CaseId, write: &CaseWrite) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.apply(case_id, write).await?;
            self.applied.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn list_comments(&self, case_id: CaseId) -> Result<Vec<Comment>> {
            tokio::task::yield_now().await;
            self.inner.list_comments(case_id).await
        }

        async fn get_comment(&self, comment_id: CommentId) -> Result<Option<Comment>> {
            tokio::task::yield_now().await;
            self.inner.get_comment(comment_id).await
        }

        async fn upsert_comment(&self, comment: &Comment) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.upsert_comment(comment).await
        }

        async fn delete_comments(&self, comment_ids: &[CommentId]) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.delete_comments(comment_ids).await
        }

        async fn user_permission(
            &self,
            case_id: CaseId,
            user_id: UserId,
        ) -> Result<Option<PermissionLevel>> {
            tokio::task::yield_now().await;
            self.inner.user_permission(case_id, user_id).await
        }

        async fn team_permissions_for_user(
            &self,
            case_id: CaseId,
            user_id: UserId,
        ) -> Result<Vec<PermissionLevel>> {
            tokio::task::yield_now().await;
            self.inner.team_permissions_for_user(case_id, user_id).await
        }

        async fn set_user_permission(
            &self,
            case_id: CaseId,
            user_id: UserId,
            level: Option<PermissionLevel>,
        ) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.set_user_permission(case_id, user_id, level).await
        }

        async fn set_team_permission(
            &self,
            case_id: CaseId,
            team_id: TeamId,
            level: Option<PermissionLevel>,
        ) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.set_team_permission(case_id, team_id, level).await
        }

        async fn find_session(&self, token: &str) -> Result<Option<UserId>> {
            tokio::task::yield_now().await;
            self.inner.find_session(token).await
        }
    }

    struct YieldingCase {
        ops: CaseOperations<YieldingStore>,
        store: Arc<YieldingStore>,
        owner: UserId,
        case_id: CaseId,
        root: ElementId,
    }

    async fn yielding_case() -> YieldingCase {
        let store = Arc::new(YieldingStore::new());
        let ops = CaseOperations::new(Arc::clone(&store), Arc::new(Broadcaster::new()));
        let owner = UserId::new_v4();
        let snapshot = ops
            .create_case(
                owner,
                CreateCasePayload {
                    name: "Dosing controller".to_string(),
                    description: None,
                    goal_description: None,
                },
            )
            .await
            .expect("create case");
        YieldingCase {
            ops,
            store,
            owner,
            case_id: snapshot.case.id,
            root: snapshot.tree.id,
        }
    }

    #[tokio::test]
    async fn concurrent_cross_moves_cannot_form_a_cycle() {
        let yc = yielding_case().await;
        let snapshot = yc
            .ops
            .create_element(
                yc.owner,
                yc.case_id,
                create(ElementKind::PropertyClaim, Some(MoveTarget::Goal(yc.root))),
            )
            .await
            .expect("P1");
        let p1 = named(&snapshot, "P1");
        let snapshot = yc
            .ops
            .create_element(
                yc.owner,
                yc.case_id,
                create(ElementKind::PropertyClaim, Some(MoveTarget::Goal(yc.root))),
            )
            .await
            .expect("P2");
        let p2 = named(&snapshot, "P2");

        let (first, second) = tokio::join!(
            yc.ops
                .move_element(yc.owner, p1, MoveTarget::PropertyClaim(p2)),
            yc.ops
                .move_element(yc.owner, p2, MoveTarget::PropertyClaim(p1)),
        );
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let err = first
            .as_ref()
            .err()
            .or(second.as_ref().err())
            .expect("one move refused");
        assert_eq!(err.code, "move_into_descendant");

        let elements = yc.store.list_elements(yc.case_id).await.expect("elements");
        let links = yc
            .store
            .list_evidence_links(yc.case_id)
            .await
            .expect("links");
        ensure_case_invariants(yc.case_id, &elements, &links).expect("stored case stays acyclic");
        yc.ops
            .create_element(
                yc.owner,
                yc.case_id,
                create(ElementKind::Strategy, Some(MoveTarget::Goal(yc.root))),
            )
            .await
            .expect("case still accepts writes");
    }

    #[tokio::test]
    async fn concurrent_lock_requests_grant_one_holder() {
        let yc = yielding_case().await;
        let editor = UserId::new_v4();
        yc.ops
            .set_user_permission(yc.owner, yc.case_id, editor, Some(PermissionLevel::Edit))
            .await
            .expect("grant");

        let (owner_lock, editor_lock) = tokio::join!(
            yc.ops.acquire_lock(yc.owner, yc.case_id),
            yc.ops.acquire_lock(editor, yc.case_id),
        );
        let winner = match (&owner_lock, &editor_lock) {
            (Ok(lock), Err(err)) | (Err(err), Ok(lock)) => {
                assert_eq!(err.code, "case_locked");
                lock.holder
            }
            _ => panic!("exactly one request should win: {owner_lock:?} / {editor_lock:?}"),
        };

        let stored = yc
            .store
            .get_case(yc.case_id)
            .await
            .expect("read")
            .expect("case");
        assert_eq!(stored.edit_lock.map(|lock| lock.holder), Some(winner));
    }

    #[tokio::test]
    async fn committed_write_survives_a_failed_case_reload() {
        let yc = yielding_case().await;
        let broadcaster = yc.ops.broadcaster();
        let (tx, mut rx) = mpsc::channel(16);
        broadcaster.add_connection(yc.case_id, UserId::new_v4(), tx);

        yc.store
            .refuse_case_reads_after_apply
            .store(true, Ordering::SeqCst);
        let snapshot = yc
            .ops
            .create_element(
                yc.owner,
                yc.case_id,
                create(ElementKind::Strategy, Some(MoveTarget::Goal(yc.root))),
            )
            .await
            .expect("write already committed");
        assert_eq!(snapshot.case.id, yc.case_id);
        let s1 = named(&snapshot, "S1");
        assert!(rx.try_recv().is_ok());

        let err = yc
            .ops
            .delete_element(yc.owner, s1)
            .await
            .expect_err("later reads still fail before any write");
        assert_eq!(err.kind, ErrorKind::Database);

        yc.store
            .refuse_case_reads_after_apply
            .store(false, Ordering::SeqCst);
        let stored = yc.store.get_element(s1).await.expect("read");
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn deleting_a_defeated_element_clears_its_defeaters() {
        let fx = fixture().await;
        let snapshot = seed_argument(&fx).await;
        let p1 = named(&snapshot, "P1");
        let s1 = named(&snapshot, "S1");
        let snapshot = fx
            .ops
            .create_element(
                fx.owner,
                fx.case_id,
                CreateElementPayload {
                    is_defeater: true,
                    defeats_element_id: Some(p1),
                    ..create(ElementKind::PropertyClaim, Some(MoveTarget::Goal(fx.root)))
                },
            )
            .await
            .expect("defeater");
        let defeater = named(&snapshot, "P3");

        let snapshot = fx.ops.delete_element(fx.owner, s1).await.expect("delete");
        let node = snapshot.tree.find(defeater).expect("defeater kept");
        assert!(node.is_defeater);
        assert_eq!(node.defeats_element_id, None);

        let stored = fx
            .store
            .get_element(defeater)
            .await
            .expect("read")
            .expect("defeater stored");
        assert_eq!(stored.defeats_element_id, None);
        let reread = fx.ops.get_case(fx.owner, fx.case_id).await.expect("read");
        assert_eq!(
            reread.tree.find(defeater).expect("defeater").defeats_element_id,
            None
        );
    }
}
