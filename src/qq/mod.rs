pub mod client;
pub mod codec;
pub mod id;
pub mod onebot;
pub mod types;

pub use client::{QqClient, QqError, SharedQqClient};
pub use codec::{AudioCodec, CodecError, CommandCodec, SharedAudioCodec};
pub use id::{ChatType, IdError, MessageKey, PortalKey, Uid, UidKind};
pub use onebot::{OneBotClient, OneBotConfig};
pub use types::*;
