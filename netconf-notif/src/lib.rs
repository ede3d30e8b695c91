pub mod config;
pub mod core;
pub mod dispatch;
pub mod manager;
pub mod notif;
pub mod subscription;

mod xml;

// Re-export commonly used types
pub use config::{DEFAULT_STREAMS_PATH, STREAMS_PATH_ENV, StreamsConfig};
pub use core::{
    BASE_EVENTS, ChangedBy, DEFAULT_STREAM, Datastore, Event, IterNext, NtfError, Result,
    SessionInfo, StreamInfo, StreamIter, TerminationReason,
};
pub use dispatch::{
    NotificationFilter, NotificationSink, NotificationSource, dispatch_receive, dispatch_send,
};
pub use manager::{NotificationManager, PublishResult};
pub use notif::{Notification, NotificationKind};
pub use subscription::{Subscription, SubscriptionError, SubscriptionRequest};
