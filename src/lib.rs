pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod identity;
pub mod invariants;
pub mod models;
pub mod operations;
pub mod permissions;
pub mod store;
pub mod sync;
pub mod tree;

pub mod prelude {
    pub use crate::algorithms::{adjacency_map, descendant_ids, is_descendant};
    #[cfg(feature = "api")]
    pub use crate::api::{AppError, AuthenticatedUser, CaseApp, routes};
    pub use crate::config::Config;
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgCaseStore, create_case_tables};
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::events::{
        Broadcaster, CaseEvent, CaseEventType, FrameDecoder, SseFrame, StreamSettings,
        Subscription, encode_event_frame,
    };
    pub use crate::identity::{
        SessionCredentials, SessionStrategy, SessionStrategyKind, SessionValidator,
    };
    pub use crate::invariants::{CaseInvariantViolation, ensure_case_invariants};
    pub use crate::models::{
        AssuranceCase, CaseId, CaseSnapshot, Comment, CommentId, ConnectionId, Element,
        ElementAttributes, ElementId, ElementKind, EvidenceLink, MoveTarget, TeamId, TreeNode,
        UserId,
    };
    pub use crate::operations::{CaseOperation, CaseOperationResult, CaseOperations};
    pub use crate::permissions::{CaseAccess, PermissionLevel};
    pub use crate::store::{CaseStore, CaseWrite, MemoryStore};
    #[cfg(feature = "client")]
    pub use crate::sync::HttpTransport;
    pub use crate::sync::{ConnectionState, EventTransport, SyncConfig, SyncConsumer};
    pub use crate::tree::{CaseTree, build_tree_from_elements};
}
