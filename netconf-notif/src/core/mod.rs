pub mod bus;
pub mod error;
pub mod event;
pub mod iterator;
pub mod registry;
pub mod rules;
pub mod stream;

pub use bus::{
    BUS_INTERFACE, BUS_MEMBER_EVENT, BUS_PATH_PREFIX, BusAddress, BusMessage, BusPoll,
    BusSubscription, EventBus, MatchRule,
};
pub use error::{NtfError, Result};
pub use event::{
    ChangedBy, Datastore, Event, NOTIFICATIONS_NS, SessionInfo, TerminationReason,
    format_datetime, parse_datetime,
};
pub use iterator::{IterNext, StreamIter};
pub use registry::{BASE_EVENTS, DEFAULT_STREAM, StreamInfo, StreamRegistry};
pub use rules::{RULES_REGION_SIZE, RuleStore};
pub use stream::{Stream, StreamRecord};
