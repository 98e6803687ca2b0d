pub mod dedup;
pub mod portal;
pub mod puppet;
pub mod qq_bridge;
pub mod resync;
pub mod user;

pub use dedup::{DedupTracker, RecentRing};
pub use portal::{
    FakeMessage, GroupSnapshot, MatrixPortalEvent, PRIVATE_CHAT_TOPIC, Portal, PortalState,
    QqPortalEvent,
};
pub use puppet::Puppet;
pub use qq_bridge::QqBridge;
pub use resync::ResyncQueue;
pub use user::{User, route_message};
