//! Per-collection coalescing of fetch/subscribe/unsubscribe traffic.
//!
//! Between `start_bulk` and `end_bulk` the connection records document
//! actions here instead of sending them. The flush groups entries per
//! collection and action, then partitions each group by whether a version
//! was recorded: a group with exactly one entry goes out as the single-form
//! frame, a larger group as the `b`-prefixed bulk form. A state transition
//! re-notifies every document in one bulk window, so it can never produce
//! more than two frames per collection per action.

use std::collections::BTreeMap;

use opcast_core::{BulkBody, Message};

/// Document actions that participate in bulk coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum BulkAction {
    Fetch,
    Subscribe,
    Unsubscribe,
}

impl BulkAction {
    /// The single-document frame for this action.
    pub fn single_frame(self, collection: &str, id: &str, version: Option<u64>) -> Message {
        let collection = collection.to_string();
        let id = id.to_string();
        match self {
            BulkAction::Fetch => Message::Fetch {
                collection,
                id,
                version,
                data: None,
                error: None,
            },
            BulkAction::Subscribe => Message::Subscribe {
                collection,
                id,
                version,
                data: None,
                error: None,
            },
            BulkAction::Unsubscribe => Message::Unsubscribe {
                collection,
                id,
                version,
                data: None,
                error: None,
            },
        }
    }

    /// The `b`-prefixed bulk frame for this action.
    pub fn bulk_frame(self, collection: &str, body: BulkBody) -> Message {
        let collection = collection.to_string();
        let body = Some(body);
        match self {
            BulkAction::Fetch => Message::BulkFetch {
                collection,
                body,
                data: None,
                error: None,
            },
            BulkAction::Subscribe => Message::BulkSubscribe {
                collection,
                body,
                data: None,
                error: None,
            },
            BulkAction::Unsubscribe => Message::BulkUnsubscribe {
                collection,
                body,
                data: None,
                error: None,
            },
        }
    }
}

/// Accumulated document actions: collection -> action -> doc id -> version.
///
/// Exists only while a bulk window is open. `BTreeMap` keys keep the flushed
/// frame order deterministic.
#[derive(Debug, Default)]
pub(crate) struct BulkAccumulator {
    collections: BTreeMap<String, BTreeMap<BulkAction, BTreeMap<String, Option<u64>>>>,
}

impl BulkAccumulator {
    /// Records one document action. Returns `true` when an entry for this
    /// (collection, action, doc) already existed; the new version wins.
    pub fn record(
        &mut self,
        action: BulkAction,
        collection: &str,
        id: &str,
        version: Option<u64>,
    ) -> bool {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .entry(action)
            .or_default()
            .insert(id.to_string(), version)
            .is_some()
    }

    /// Drains the accumulator into the frames to send, in collection order.
    pub fn flush(self) -> Vec<Message> {
        let mut frames = Vec::new();
        for (collection, actions) in self.collections {
            for (action, entries) in actions {
                let mut versioned: BTreeMap<String, Option<u64>> = BTreeMap::new();
                let mut bare: Vec<String> = Vec::new();
                for (id, version) in entries {
                    if version.is_some() {
                        versioned.insert(id, version);
                    } else {
                        bare.push(id);
                    }
                }

                if versioned.len() == 1 {
                    let (id, version) = versioned.pop_first().expect("one entry");
                    frames.push(action.single_frame(&collection, &id, version));
                } else if !versioned.is_empty() {
                    frames.push(action.bulk_frame(&collection, BulkBody::Versions(versioned)));
                }

                if bare.len() == 1 {
                    frames.push(action.single_frame(&collection, &bare[0], None));
                } else if !bare.is_empty() {
                    frames.push(action.bulk_frame(&collection, BulkBody::Ids(bare)));
                }
            }
        }
        frames
    }
}
