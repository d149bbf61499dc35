//! # courier-core
//!
//! Shared vocabulary for the Courier delivery layer.
//!
//! - **Branded IDs**: `UserId`, `ConversationId`, `MessageId`, `NotificationId`, `ConnectionId`
//! - **Domain records**: `Identity`, `UserRecord`, `Conversation`, `StoredMessage`, `Notification`
//! - **Collaborator traits**: `MessageStore`, `ConversationStore`, `UserStore`,
//!   `NotificationStore` bundled as [`store::Stores`]
//! - **Errors**: [`errors::StoreError`] for every collaborator call
//! - **Logging**: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod models;
pub mod store;

pub use errors::StoreError;
pub use ids::{ConnectionId, ConversationId, MessageId, NotificationId, UserId};
pub use models::{
    Conversation, Identity, MessageStatus, MissedQuery, NewMessage, NewNotification,
    Notification, NotificationKind, NotificationPriority, NotificationStatus, PresenceStatus,
    StoredMessage, UserRecord,
};
pub use store::{ConversationStore, MessageStore, NotificationStore, Stores, UserStore};
