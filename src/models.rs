use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LibError, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(UserId);
uuid_id!(TeamId);
uuid_id!(
    /// One assurance case: the unit of permissioning and of live subscription.
    CaseId
);
uuid_id!(ElementId);
uuid_id!(CommentId);
uuid_id!(
    /// An open push channel. Lives only in server memory.
    ConnectionId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementKind {
    Goal,
    Strategy,
    PropertyClaim,
    Evidence,
    /// Standalone context nodes predate goal-level context strings and are kept for old cases.
    Context,
}

impl ElementKind {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            ElementKind::Goal => "goal",
            ElementKind::Strategy => "strategy",
            ElementKind::PropertyClaim => "property_claim",
            ElementKind::Evidence => "evidence",
            ElementKind::Context => "context",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "goal" => Some(ElementKind::Goal),
            "strategy" => Some(ElementKind::Strategy),
            "property_claim" => Some(ElementKind::PropertyClaim),
            "evidence" => Some(ElementKind::Evidence),
            "context" => Some(ElementKind::Context),
            _ => None,
        }
    }

    /// Prefix of the human-readable label ("G1", "P3", ...).
    pub const fn label_prefix(self) -> &'static str {
        match self {
            ElementKind::Goal => "G",
            ElementKind::Strategy => "S",
            ElementKind::PropertyClaim => "P",
            ElementKind::Evidence => "E",
            ElementKind::Context => "C",
        }
    }

    pub const fn allows(self, attribute: Attribute) -> bool {
        use ElementKind::*;
        match attribute {
            Attribute::Context => matches!(self, Goal),
            Attribute::Role => matches!(self, Strategy | PropertyClaim),
            Attribute::Assumption | Attribute::Justification => {
                matches!(self, Goal | Strategy | PropertyClaim)
            }
            Attribute::Url => matches!(self, PropertyClaim | Evidence),
            Attribute::Level => matches!(self, PropertyClaim),
            Attribute::ModuleReference | Attribute::ModuleEmbedType | Attribute::ModuleSummary => {
                matches!(self, Goal | Strategy)
            }
        }
    }
}

/// Kind-specific attribute names, used to reject writes that do not apply to a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Context,
    Role,
    Assumption,
    Justification,
    Url,
    Level,
    ModuleReference,
    ModuleEmbedType,
    ModuleSummary,
}

impl Attribute {
    pub const fn as_str(self) -> &'static str {
        match self {
            Attribute::Context => "context",
            Attribute::Role => "role",
            Attribute::Assumption => "assumption",
            Attribute::Justification => "justification",
            Attribute::Url => "url",
            Attribute::Level => "level",
            Attribute::ModuleReference => "moduleReferenceId",
            Attribute::ModuleEmbedType => "moduleEmbedType",
            Attribute::ModuleSummary => "moduleSummary",
        }
    }
}

/// Storage shape of the kind-specific columns. Every field is optional here; the tree
/// projection decides which ones a node actually carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_reference_id: Option<CaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_embed_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_summary: Option<String>,
}

impl ElementAttributes {
    fn present(&self) -> Vec<Attribute> {
        let mut present = Vec::new();
        if self.context.is_some() {
            present.push(Attribute::Context);
        }
        if self.role.is_some() {
            present.push(Attribute::Role);
        }
        if self.assumption.is_some() {
            present.push(Attribute::Assumption);
        }
        if self.justification.is_some() {
            present.push(Attribute::Justification);
        }
        if self.url.is_some() {
            present.push(Attribute::Url);
        }
        if self.level.is_some() {
            present.push(Attribute::Level);
        }
        if self.module_reference_id.is_some() {
            present.push(Attribute::ModuleReference);
        }
        if self.module_embed_type.is_some() {
            present.push(Attribute::ModuleEmbedType);
        }
        if self.module_summary.is_some() {
            present.push(Attribute::ModuleSummary);
        }
        present
    }

    pub fn inapplicable_for(&self, kind: ElementKind) -> Vec<Attribute> {
        self.present()
            .into_iter()
            .filter(|attribute| !kind.allows(*attribute))
            .collect()
    }

    pub fn ensure_applicable(&self, kind: ElementKind) -> Result<()> {
        let inapplicable = self.inapplicable_for(kind);
        if inapplicable.is_empty() {
            return Ok(());
        }
        let names = inapplicable
            .iter()
            .map(|attribute| attribute.as_str())
            .collect::<Vec<_>>();
        Err(LibError::invalid_with_code(
            "attribute_not_applicable",
            "Attribute does not apply to this element kind",
            anyhow!(
                "attributes {:?} are not valid for {}",
                names,
                kind.as_db_value()
            ),
        ))
    }

    /// Overlay the fields present in `patch`.
    pub fn merge(&mut self, patch: ElementAttributes) {
        if patch.context.is_some() {
            self.context = patch.context;
        }
        if patch.role.is_some() {
            self.role = patch.role;
        }
        if patch.assumption.is_some() {
            self.assumption = patch.assumption;
        }
        if patch.justification.is_some() {
            self.justification = patch.justification;
        }
        if patch.url.is_some() {
            self.url = patch.url;
        }
        if patch.level.is_some() {
            self.level = patch.level;
        }
        if patch.module_reference_id.is_some() {
            self.module_reference_id = patch.module_reference_id;
        }
        if patch.module_embed_type.is_some() {
            self.module_embed_type = patch.module_embed_type;
        }
        if patch.module_summary.is_some() {
            self.module_summary = patch.module_summary;
        }
    }
}

/// Flat storage row for one argument element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    pub case_id: CaseId,
    pub kind: ElementKind,
    pub parent_id: Option<ElementId>,
    pub name: String,
    pub description: String,
    pub in_sandbox: bool,
    pub hidden: bool,
    pub attributes: ElementAttributes,
    pub from_pattern: bool,
    pub modified_from_pattern: bool,
    pub is_defeater: bool,
    pub defeats_element_id: Option<ElementId>,
    pub created_at: NaiveDateTime,
}

impl Element {
    pub fn new(
        case_id: CaseId,
        kind: ElementKind,
        name: impl Into<String>,
        parent_id: Option<ElementId>,
        created_at: NaiveDateTime,
    ) -> Self {
        Self {
            id: ElementId::new_v4(),
            case_id,
            kind,
            parent_id,
            name: name.into(),
            description: String::new(),
            in_sandbox: false,
            hidden: false,
            attributes: ElementAttributes::default(),
            from_pattern: false,
            modified_from_pattern: false,
            is_defeater: false,
            defeats_element_id: None,
            created_at,
        }
    }

    /// The case root: an active, parentless goal.
    pub fn is_root_goal(&self) -> bool {
        self.kind == ElementKind::Goal && self.parent_id.is_none() && !self.in_sandbox
    }

    pub fn is_structural(&self) -> bool {
        self.kind != ElementKind::Evidence
    }
}

/// Evidence supports one or more property claims; the only non-tree edge in a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceLink {
    pub evidence_id: ElementId,
    pub property_claim_id: ElementId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditLock {
    pub holder: UserId,
    pub token: Uuid,
    pub acquired_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssuranceCase {
    pub id: CaseId,
    pub owner_user_id: UserId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_lock: Option<EditLock>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub case_id: CaseId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_id: Option<ElementId>,
    pub author_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_comment_id: Option<CommentId>,
    pub content: String,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Kind tag plus the attributes that apply to that kind. Serialized flat into
/// the owning [`TreeNode`], so a node never carries another kind's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum NodeAttributes {
    Goal {
        context: Vec<String>,
        assumption: Option<String>,
        justification: Option<String>,
        module_reference_id: Option<CaseId>,
        module_embed_type: Option<String>,
        module_summary: Option<String>,
    },
    Strategy {
        role: Option<String>,
        assumption: Option<String>,
        justification: Option<String>,
        module_reference_id: Option<CaseId>,
        module_embed_type: Option<String>,
        module_summary: Option<String>,
    },
    PropertyClaim {
        role: Option<String>,
        assumption: Option<String>,
        justification: Option<String>,
        url: Option<String>,
        level: Option<i32>,
    },
    Evidence {
        url: Option<String>,
    },
    Context {},
}

impl NodeAttributes {
    pub fn project(kind: ElementKind, attributes: &ElementAttributes) -> Self {
        let attributes = attributes.clone();
        match kind {
            ElementKind::Goal => NodeAttributes::Goal {
                context: attributes.context.unwrap_or_default(),
                assumption: attributes.assumption,
                justification: attributes.justification,
                module_reference_id: attributes.module_reference_id,
                module_embed_type: attributes.module_embed_type,
                module_summary: attributes.module_summary,
            },
            ElementKind::Strategy => NodeAttributes::Strategy {
                role: attributes.role,
                assumption: attributes.assumption,
                justification: attributes.justification,
                module_reference_id: attributes.module_reference_id,
                module_embed_type: attributes.module_embed_type,
                module_summary: attributes.module_summary,
            },
            ElementKind::PropertyClaim => NodeAttributes::PropertyClaim {
                role: attributes.role,
                assumption: attributes.assumption,
                justification: attributes.justification,
                url: attributes.url,
                level: attributes.level,
            },
            ElementKind::Evidence => NodeAttributes::Evidence {
                url: attributes.url,
            },
            ElementKind::Context => NodeAttributes::Context {},
        }
    }

    pub const fn kind(&self) -> ElementKind {
        match self {
            NodeAttributes::Goal { .. } => ElementKind::Goal,
            NodeAttributes::Strategy { .. } => ElementKind::Strategy,
            NodeAttributes::PropertyClaim { .. } => ElementKind::PropertyClaim,
            NodeAttributes::Evidence { .. } => ElementKind::Evidence,
            NodeAttributes::Context { .. } => ElementKind::Context,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: ElementId,
    pub name: String,
    pub description: String,
    pub hidden: bool,
    pub in_sandbox: bool,
    pub from_pattern: bool,
    pub modified_from_pattern: bool,
    pub is_defeater: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defeats_element_id: Option<ElementId>,
    #[serde(flatten)]
    pub attributes: NodeAttributes,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn leaf(element: &Element) -> Self {
        Self {
            id: element.id,
            name: element.name.clone(),
            description: element.description.clone(),
            hidden: element.hidden,
            in_sandbox: element.in_sandbox,
            from_pattern: element.from_pattern,
            modified_from_pattern: element.modified_from_pattern,
            is_defeater: element.is_defeater,
            defeats_element_id: element.defeats_element_id,
            attributes: NodeAttributes::project(element.kind, &element.attributes),
            children: Vec::new(),
        }
    }

    pub const fn kind(&self) -> ElementKind {
        self.attributes.kind()
    }

    pub fn find(&self, id: ElementId) -> Option<&TreeNode> {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.id == id {
                return Some(node);
            }
            stack.extend(node.children.iter().rev());
        }
        None
    }

    /// Pre-order ids; evidence shared by several claims appears once per claim.
    pub fn preorder_ids(&self) -> Vec<ElementId> {
        let mut ids = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            ids.push(node.id);
            stack.extend(node.children.iter().rev());
        }
        ids
    }
}

// Flattens the subtree before freeing it so deep chains do not exhaust the stack.
impl Drop for TreeNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

/// What a caller re-renders from after every read or mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseSnapshot {
    pub case: AssuranceCase,
    pub tree: TreeNode,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub root_inferred: bool,
    pub orphaned_elements: Vec<TreeNode>,
}

/// Structural destination chosen explicitly by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoveTarget {
    Goal(ElementId),
    Strategy(ElementId),
    PropertyClaim(ElementId),
}

impl MoveTarget {
    pub const fn id(self) -> ElementId {
        match self {
            MoveTarget::Goal(id) | MoveTarget::Strategy(id) | MoveTarget::PropertyClaim(id) => id,
        }
    }

    pub const fn kind(self) -> ElementKind {
        match self {
            MoveTarget::Goal(_) => ElementKind::Goal,
            MoveTarget::Strategy(_) => ElementKind::Strategy,
            MoveTarget::PropertyClaim(_) => ElementKind::PropertyClaim,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCasePayload {
    pub name: String,
    pub description: Option<String>,
    pub goal_description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateElementPayload {
    pub kind: ElementKind,
    pub parent: Option<MoveTarget>,
    #[serde(default)]
    pub claim_ids: Vec<ElementId>,
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: ElementAttributes,
    #[serde(default)]
    pub is_defeater: bool,
    pub defeats_element_id: Option<ElementId>,
}

/// Partial element record. `target` re-parents, `claim_ids` replaces an evidence link set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateElementPayload {
    pub name: Option<String>,
    pub description: Option<String>,
    pub attributes: Option<ElementAttributes>,
    pub hidden: Option<bool>,
    pub target: Option<MoveTarget>,
    pub claim_ids: Option<Vec<ElementId>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachEvidencePayload {
    pub claim_ids: Vec<ElementId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommentPayload {
    pub element_id: Option<ElementId>,
    pub parent_comment_id: Option<CommentId>,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCommentPayload {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveCommentPayload {
    pub resolved: bool,
}

pub(crate) fn normalize_name(name: &str, public: &'static str) -> Result<String> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(LibError::invalid(public, anyhow!("empty name")));
    }
    Ok(name)
}

pub(crate) fn normalize_claim_ids(claim_ids: &[ElementId]) -> Result<Vec<ElementId>> {
    if claim_ids.is_empty() {
        return Err(LibError::invalid(
            "At least one property claim is required",
            anyhow!("empty claim id set"),
        ));
    }
    let mut seen = HashSet::with_capacity(claim_ids.len());
    Ok(claim_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect())
}

/// Next free label for `kind` ("P4" when P1..P3 exist). Names that do not follow the
/// prefix-number shape are ignored.
pub fn next_label(elements: &[Element], kind: ElementKind) -> Result<String> {
    let prefix = kind.label_prefix();
    let highest = elements
        .iter()
        .filter(|element| element.kind == kind)
        .filter_map(|element| element.name.strip_prefix(prefix))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    let next = highest.checked_add(1).ok_or_else(|| {
        LibError::conflict_with_code(
            "label_space_exhausted",
            "No label numbers are left for this element kind",
            anyhow!("{}{} is the highest possible label", prefix, highest),
        )
    })?;
    Ok(format!("{}{}", prefix, next))
}
