use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::models::{AssuranceCase, CaseId, UserId};
use crate::store::CaseStore;

/// Case permission levels, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionLevel {
    View,
    Comment,
    Edit,
    Admin,
}

pub const ALL_PERMISSION_LEVELS: &[PermissionLevel] = &[
    PermissionLevel::View,
    PermissionLevel::Comment,
    PermissionLevel::Edit,
    PermissionLevel::Admin,
];

/// Read the tree and subscribe to its events.
pub const CASE_READ_LEVEL: PermissionLevel = PermissionLevel::View;
/// Add, edit and resolve comments.
pub const CASE_COMMENT_LEVEL: PermissionLevel = PermissionLevel::Comment;
/// Run element mutations and take the edit lock.
pub const CASE_EDIT_LEVEL: PermissionLevel = PermissionLevel::Edit;
/// Manage sharing and team grants.
pub const CASE_SHARE_LEVEL: PermissionLevel = PermissionLevel::Admin;

impl PermissionLevel {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            PermissionLevel::View => "VIEW",
            PermissionLevel::Comment => "COMMENT",
            PermissionLevel::Edit => "EDIT",
            PermissionLevel::Admin => "ADMIN",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "VIEW" => Some(PermissionLevel::View),
            "COMMENT" => Some(PermissionLevel::Comment),
            "EDIT" => Some(PermissionLevel::Edit),
            "ADMIN" => Some(PermissionLevel::Admin),
            _ => None,
        }
    }

    const fn denied_message(self) -> &'static str {
        match self {
            PermissionLevel::View => "You do not have access to this case",
            PermissionLevel::Comment => "You do not have permission to comment on this case",
            PermissionLevel::Edit => "You do not have permission to edit this case",
            PermissionLevel::Admin => "You do not have permission to manage sharing for this case",
        }
    }
}

pub fn has_permission_level(have: PermissionLevel, need: PermissionLevel) -> bool {
    have >= need
}

/// Answer to "what may this user do on this case".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseAccess {
    pub has_access: bool,
    pub permission: Option<PermissionLevel>,
    pub is_owner: bool,
}

impl CaseAccess {
    pub const fn owner() -> Self {
        Self {
            has_access: true,
            permission: Some(PermissionLevel::Admin),
            is_owner: true,
        }
    }

    pub const fn granted(permission: Option<PermissionLevel>) -> Self {
        Self {
            has_access: permission.is_some(),
            permission,
            is_owner: false,
        }
    }

    pub fn allows(&self, need: PermissionLevel) -> bool {
        self.permission
            .is_some_and(|have| has_permission_level(have, need))
    }
}

/// Max of the direct grant and every team grant; the creator is always ADMIN.
pub async fn resolve_case_access<S: CaseStore>(
    store: &S,
    actor: UserId,
    case: &AssuranceCase,
) -> Result<CaseAccess> {
    if case.owner_user_id == actor {
        return Ok(CaseAccess::owner());
    }

    let direct = store.user_permission(case.id, actor).await?;
    let teams = store.team_permissions_for_user(case.id, actor).await?;
    Ok(CaseAccess::granted(direct.into_iter().chain(teams).max()))
}

pub async fn load_case<S: CaseStore>(store: &S, case_id: CaseId) -> Result<AssuranceCase> {
    store.get_case(case_id).await?.ok_or_else(|| {
        LibError::not_found("Case not found", anyhow!("case {} not found", case_id))
    })
}

pub async fn case_access<S: CaseStore>(
    store: &S,
    actor: UserId,
    case_id: CaseId,
) -> Result<CaseAccess> {
    let case = load_case(store, case_id).await?;
    resolve_case_access(store, actor, &case).await
}

/// Loads the case and fails with `Forbidden` unless `actor` holds at least `need`.
pub async fn require_case_permission<S: CaseStore>(
    store: &S,
    actor: UserId,
    case_id: CaseId,
    need: PermissionLevel,
) -> Result<(AssuranceCase, CaseAccess)> {
    let case = load_case(store, case_id).await?;
    let access = resolve_case_access(store, actor, &case).await?;
    if !access.allows(need) {
        return Err(LibError::forbidden(
            need.denied_message(),
            anyhow!(
                "user {} holds {:?} on case {}, needs {}",
                actor,
                access.permission,
                case_id,
                need.as_db_value()
            ),
        ));
    }
    Ok((case, access))
}
