//! `cluster:sync` payload shapes (spec.md §4.2, §4.5).

use serde::{Deserialize, Serialize};

/// One `cluster:sync` message, dispatched by `event` (spec.md §4.5).
/// Unknown events deserialize to [`SyncEvent::Unknown`] and are logged,
/// never rejected — forward compatibility with newer peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SyncEvent {
    #[serde(rename = "state")]
    State {
        index: String,
        collection: String,
        #[serde(default)]
        post: Option<String>,
    },
    #[serde(rename = "state:all")]
    StateAll {
        #[serde(default)]
        post: Option<String>,
    },
    #[serde(rename = "indexCache:add")]
    IndexCacheAdd { index: String, collection: String },
    #[serde(rename = "indexCache:remove")]
    IndexCacheRemove { index: String, collection: String },
    #[serde(rename = "profile")]
    Profile { id: String },
    #[serde(rename = "role")]
    Role { id: String },
    #[serde(rename = "validators")]
    Validators,
    #[serde(rename = "strategies")]
    Strategies,
    #[serde(other)]
    Unknown,
}
