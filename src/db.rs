use anyhow::anyhow;
use chrono::{NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{LibError, Result};
use crate::models::{
    AssuranceCase, CaseId, Comment, CommentId, EditLock, Element, ElementAttributes, ElementId,
    ElementKind, EvidenceLink, TeamId, UserId,
};
use crate::permissions::PermissionLevel;
use crate::store::{CaseStore, CaseWrite};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_case_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[derive(Debug, Clone, FromRow)]
struct CaseRow {
    id: Uuid,
    owner_user_id: Uuid,
    name: String,
    description: Option<String>,
    lock_holder: Option<Uuid>,
    lock_token: Option<Uuid>,
    lock_acquired_at: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct ElementRow {
    id: Uuid,
    case_id: Uuid,
    kind: String,
    parent_id: Option<Uuid>,
    name: String,
    description: String,
    in_sandbox: bool,
    hidden: bool,
    attributes: Json<ElementAttributes>,
    from_pattern: bool,
    modified_from_pattern: bool,
    is_defeater: bool,
    defeats_element_id: Option<Uuid>,
    created_at: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct EvidenceLinkRow {
    evidence_id: Uuid,
    property_claim_id: Uuid,
}

#[derive(Debug, Clone, FromRow)]
struct CommentRow {
    id: Uuid,
    case_id: Uuid,
    element_id: Option<Uuid>,
    author_id: Uuid,
    parent_comment_id: Option<Uuid>,
    content: String,
    resolved: bool,
    resolved_by: Option<Uuid>,
    resolved_at: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl From<CaseRow> for AssuranceCase {
    fn from(value: CaseRow) -> Self {
        let edit_lock = match (value.lock_holder, value.lock_token, value.lock_acquired_at) {
            (Some(holder), Some(token), Some(acquired_at)) => Some(EditLock {
                holder: UserId(holder),
                token,
                acquired_at,
            }),
            _ => None,
        };
        Self {
            id: CaseId(value.id),
            owner_user_id: UserId(value.owner_user_id),
            name: value.name,
            description: value.description,
            edit_lock,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

impl TryFrom<ElementRow> for Element {
    type Error = LibError;

    fn try_from(value: ElementRow) -> Result<Self> {
        let kind = ElementKind::from_db_value(&value.kind).ok_or_else(|| {
            LibError::database(
                "Stored element is malformed",
                anyhow!("element {} has unknown kind '{}'", value.id, value.kind),
            )
        })?;
        Ok(Self {
            id: ElementId(value.id),
            case_id: CaseId(value.case_id),
            kind,
            parent_id: value.parent_id.map(ElementId),
            name: value.name,
            description: value.description,
            in_sandbox: value.in_sandbox,
            hidden: value.hidden,
            attributes: value.attributes.0,
            from_pattern: value.from_pattern,
            modified_from_pattern: value.modified_from_pattern,
            is_defeater: value.is_defeater,
            defeats_element_id: value.defeats_element_id.map(ElementId),
            created_at: value.created_at,
        })
    }
}

impl From<EvidenceLinkRow> for EvidenceLink {
    fn from(value: EvidenceLinkRow) -> Self {
        Self {
            evidence_id: ElementId(value.evidence_id),
            property_claim_id: ElementId(value.property_claim_id),
        }
    }
}

impl From<CommentRow> for Comment {
    fn from(value: CommentRow) -> Self {
        Self {
            id: CommentId(value.id),
            case_id: CaseId(value.case_id),
            element_id: value.element_id.map(ElementId),
            author_id: UserId(value.author_id),
            parent_comment_id: value.parent_comment_id.map(CommentId),
            content: value.content,
            resolved: value.resolved,
            resolved_by: value.resolved_by.map(UserId),
            resolved_at: value.resolved_at,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

fn parse_permission(raw: &str) -> Result<PermissionLevel> {
    PermissionLevel::from_db_value(raw).ok_or_else(|| {
        LibError::database(
            "Stored permission is malformed",
            anyhow!("unknown permission level '{}'", raw),
        )
    })
}

async fn upsert_element(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    element: &Element,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cases.elements (
            id,
            case_id,
            kind,
            parent_id,
            name,
            description,
            in_sandbox,
            hidden,
            attributes,
            from_pattern,
            modified_from_pattern,
            is_defeater,
            defeats_element_id,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (id) DO UPDATE
        SET parent_id = EXCLUDED.parent_id,
            name = EXCLUDED.name,
            description = EXCLUDED.description,
            in_sandbox = EXCLUDED.in_sandbox,
            hidden = EXCLUDED.hidden,
            attributes = EXCLUDED.attributes,
            modified_from_pattern = EXCLUDED.modified_from_pattern,
            is_defeater = EXCLUDED.is_defeater,
            defeats_element_id = EXCLUDED.defeats_element_id
        "#,
    )
    .bind(element.id.0)
    .bind(element.case_id.0)
    .bind(element.kind.as_db_value())
    .bind(element.parent_id.map(|id| id.0))
    .bind(&element.name)
    .bind(&element.description)
    .bind(element.in_sandbox)
    .bind(element.hidden)
    .bind(Json(&element.attributes))
    .bind(element.from_pattern)
    .bind(element.modified_from_pattern)
    .bind(element.is_defeater)
    .bind(element.defeats_element_id.map(|id| id.0))
    .bind(element.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to write case elements", err))?;
    Ok(())
}

/// Postgres-backed [`CaseStore`]. Tables live in the `cases` schema.
#[derive(Debug, Clone)]
pub struct PgCaseStore {
    pool: PgPool,
}

impl PgCaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl CaseStore for PgCaseStore {
    async fn get_case(&self, case_id: CaseId) -> Result<Option<AssuranceCase>> {
        let row = sqlx::query_as::<_, CaseRow>(
            r#"
            SELECT
                id,
                owner_user_id,
                name,
                description,
                lock_holder,
                lock_token,
                lock_acquired_at,
                created_at,
                updated_at
            FROM cases.cases
            WHERE id = $1
            "#,
        )
        .bind(case_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query case", err))?;

        Ok(row.map(AssuranceCase::from))
    }

    async fn insert_case(&self, case: &AssuranceCase, root: &Element) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;

        sqlx::query(
            r#"
            INSERT INTO cases.cases (
                id,
                owner_user_id,
                name,
                description,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(case.id.0)
        .bind(case.owner_user_id.0)
        .bind(&case.name)
        .bind(&case.description)
        .bind(case.created_at)
        .bind(case.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to create case", err))?;

        upsert_element(&mut tx, root).await?;

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;
        Ok(())
    }

    async fn update_case(&self, case: &AssuranceCase) -> Result<()> {
        let lock = case.edit_lock.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE cases.cases
            SET name = $1,
                description = $2,
                lock_holder = $3,
                lock_token = $4,
                lock_acquired_at = $5,
                updated_at = $6
            WHERE id = $7
            "#,
        )
        .bind(&case.name)
        .bind(&case.description)
        .bind(lock.map(|lock| lock.holder.0))
        .bind(lock.map(|lock| lock.token))
        .bind(lock.map(|lock| lock.acquired_at))
        .bind(case.updated_at)
        .bind(case.id.0)
        .execute(&self.pool)
        .await
        .map_err(|err| db_err("Failed to update case", err))?;

        if result.rows_affected() == 0 {
            return Err(LibError::not_found(
                "Case not found",
                anyhow!("case {} not found", case.id),
            ));
        }
        Ok(())
    }

    async fn list_elements(&self, case_id: CaseId) -> Result<Vec<Element>> {
        let rows = sqlx::query_as::<_, ElementRow>(
            r#"
            SELECT
                id,
                case_id,
                kind,
                parent_id,
                name,
                description,
                in_sandbox,
                hidden,
                attributes,
                from_pattern,
                modified_from_pattern,
                is_defeater,
                defeats_element_id,
                created_at
            FROM cases.elements
            WHERE case_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(case_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query case elements", err))?;

        rows.into_iter().map(Element::try_from).collect()
    }

    async fn list_evidence_links(&self, case_id: CaseId) -> Result<Vec<EvidenceLink>> {
        let rows = sqlx::query_as::<_, EvidenceLinkRow>(
            r#"
            SELECT evidence_id, property_claim_id
            FROM cases.evidence_links
            WHERE case_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(case_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query evidence links", err))?;

        Ok(rows.into_iter().map(EvidenceLink::from).collect())
    }

    async fn get_element(&self, element_id: ElementId) -> Result<Option<Element>> {
        let row = sqlx::query_as::<_, ElementRow>(
            r#"
            SELECT
                id,
                case_id,
                kind,
                parent_id,
                name,
                description,
                in_sandbox,
                hidden,
                attributes,
                from_pattern,
                modified_from_pattern,
                is_defeater,
                defeats_element_id,
                created_at
            FROM cases.elements
            WHERE id = $1
            "#,
        )
        .bind(element_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query element", err))?;

        row.map(Element::try_from).transpose()
    }

    async fn apply(&self, case_id: CaseId, write: &CaseWrite) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;

        for link in &write.remove_links {
            sqlx::query(
                r#"
                DELETE FROM cases.evidence_links
                WHERE evidence_id = $1
                  AND property_claim_id = $2
                "#,
            )
            .bind(link.evidence_id.0)
            .bind(link.property_claim_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to remove evidence links", err))?;
        }

        if !write.delete_elements.is_empty() {
            let ids = write
                .delete_elements
                .iter()
                .map(|id| id.0)
                .collect::<Vec<_>>();
            sqlx::query(
                r#"
                DELETE FROM cases.elements
                WHERE case_id = $1
                  AND id = ANY($2)
                "#,
            )
            .bind(case_id.0)
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to delete case elements", err))?;
        }

        for element in &write.upsert_elements {
            upsert_element(&mut tx, element).await?;
        }

        for link in &write.add_links {
            sqlx::query(
                r#"
                INSERT INTO cases.evidence_links (case_id, evidence_id, property_claim_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (evidence_id, property_claim_id) DO NOTHING
                "#,
            )
            .bind(case_id.0)
            .bind(link.evidence_id.0)
            .bind(link.property_claim_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to add evidence links", err))?;
        }

        sqlx::query(
            r#"
            UPDATE cases.cases
            SET updated_at = $1
            WHERE id = $2
            "#,
        )
        .bind(Utc::now().naive_utc())
        .bind(case_id.0)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to touch case", err))?;

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;
        Ok(())
    }

    async fn list_comments(&self, case_id: CaseId) -> Result<Vec<Comment>> {
        let rows = sqlx::query_as::<_, CommentRow>(
            r#"
            SELECT
                id,
                case_id,
                element_id,
                author_id,
                parent_comment_id,
                content,
                resolved,
                resolved_by,
                resolved_at,
                created_at,
                updated_at
            FROM cases.comments
            WHERE case_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(case_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query comments", err))?;

        Ok(rows.into_iter().map(Comment::from).collect())
    }

    async fn get_comment(&self, comment_id: CommentId) -> Result<Option<Comment>> {
        let row = sqlx::query_as::<_, CommentRow>(
            r#"
            SELECT
                id,
                case_id,
                element_id,
                author_id,
                parent_comment_id,
                content,
                resolved,
                resolved_by,
                resolved_at,
                created_at,
                updated_at
            FROM cases.comments
            WHERE id = $1
            "#,
        )
        .bind(comment_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query comment", err))?;

        Ok(row.map(Comment::from))
    }

    async fn upsert_comment(&self, comment: &Comment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cases.comments (
                id,
                case_id,
                element_id,
                author_id,
                parent_comment_id,
                content,
                resolved,
                resolved_by,
                resolved_at,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET content = EXCLUDED.content,
                resolved = EXCLUDED.resolved,
                resolved_by = EXCLUDED.resolved_by,
                resolved_at = EXCLUDED.resolved_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(comment.id.0)
        .bind(comment.case_id.0)
        .bind(comment.element_id.map(|id| id.0))
        .bind(comment.author_id.0)
        .bind(comment.parent_comment_id.map(|id| id.0))
        .bind(&comment.content)
        .bind(comment.resolved)
        .bind(comment.resolved_by.map(|id| id.0))
        .bind(comment.resolved_at)
        .bind(comment.created_at)
        .bind(comment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| db_err("Failed to write comment", err))?;
        Ok(())
    }

    async fn delete_comments(&self, comment_ids: &[CommentId]) -> Result<()> {
        let ids = comment_ids.iter().map(|id| id.0).collect::<Vec<_>>();
        sqlx::query(
            r#"
            DELETE FROM cases.comments
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await
        .map_err(|err| db_err("Failed to delete comments", err))?;
        Ok(())
    }

    async fn user_permission(
        &self,
        case_id: CaseId,
        user_id: UserId,
    ) -> Result<Option<PermissionLevel>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT permission
            FROM cases.user_permissions
            WHERE case_id = $1
              AND user_id = $2
            "#,
        )
        .bind(case_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query case permissions", err))?;

        row.map(|(raw,)| parse_permission(&raw)).transpose()
    }

    async fn team_permissions_for_user(
        &self,
        case_id: CaseId,
        user_id: UserId,
    ) -> Result<Vec<PermissionLevel>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT tp.permission
            FROM cases.team_permissions tp
            JOIN cases.team_memberships tm
            ON tm.team_id = tp.team_id
            WHERE tp.case_id = $1
              AND tm.user_id = $2
            "#,
        )
        .bind(case_id.0)
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query team permissions", err))?;

        rows.iter().map(|(raw,)| parse_permission(raw)).collect()
    }

    async fn set_user_permission(
        &self,
        case_id: CaseId,
        user_id: UserId,
        level: Option<PermissionLevel>,
    ) -> Result<()> {
        let query = match level {
            Some(level) => sqlx::query(
                r#"
                INSERT INTO cases.user_permissions (case_id, user_id, permission)
                VALUES ($1, $2, $3)
                ON CONFLICT (case_id, user_id) DO UPDATE
                SET permission = EXCLUDED.permission
                "#,
            )
            .bind(case_id.0)
            .bind(user_id.0)
            .bind(level.as_db_value()),
            None => sqlx::query(
                r#"
                DELETE FROM cases.user_permissions
                WHERE case_id = $1
                  AND user_id = $2
                "#,
            )
            .bind(case_id.0)
            .bind(user_id.0),
        };
        query
            .execute(&self.pool)
            .await
            .map_err(|err| db_err("Failed to update case permissions", err))?;
        Ok(())
    }

    async fn set_team_permission(
        &self,
        case_id: CaseId,
        team_id: TeamId,
        level: Option<PermissionLevel>,
    ) -> Result<()> {
        let query = match level {
            Some(level) => sqlx::query(
                r#"
                INSERT INTO cases.team_permissions (case_id, team_id, permission)
                VALUES ($1, $2, $3)
                ON CONFLICT (case_id, team_id) DO UPDATE
                SET permission = EXCLUDED.permission
                "#,
            )
            .bind(case_id.0)
            .bind(team_id.0)
            .bind(level.as_db_value()),
            None => sqlx::query(
                r#"
                DELETE FROM cases.team_permissions
                WHERE case_id = $1
                  AND team_id = $2
                "#,
            )
            .bind(case_id.0)
            .bind(team_id.0),
        };
        query
            .execute(&self.pool)
            .await
            .map_err(|err| db_err("Failed to update team permissions", err))?;
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<UserId>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT user_id
            FROM cases.sessions
            WHERE token = $1
              AND expires_at > $2
            "#,
        )
        .bind(token)
        .bind(Utc::now().naive_utc())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query session", err))?;

        Ok(row.map(|(user_id,)| UserId(user_id)))
    }
}
