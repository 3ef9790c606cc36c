//! Push channel event types.
//!
//! The real-time channel delivers item lifecycle events as JSON frames tagged
//! by `type`. Connection lifecycle is reported separately through
//! [`ChannelSignal`] so the invalidator can track its own state.

use crate::item::{ItemId, ItemStatus, Partition};
use serde::{Deserialize, Serialize};

/// Item lifecycle events broadcast by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ItemEvent {
    /// Generation progressed, completed or failed.
    #[serde(rename = "item:statusChanged")]
    StatusChanged {
        id: ItemId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ItemStatus>,
    },

    /// An item moved from the active partition to the trash.
    #[serde(rename = "item:archived")]
    Archived { id: ItemId },

    /// An item moved from the trash back to the active partition.
    #[serde(rename = "item:restored")]
    Restored { id: ItemId },

    /// An item was permanently deleted.
    #[serde(rename = "item:deleted")]
    Deleted { id: ItemId },
}

impl ItemEvent {
    /// Get the event type as a string for logging/debugging.
    pub fn event_type(&self) -> &'static str {
        match self {
            ItemEvent::StatusChanged { .. } => "item:statusChanged",
            ItemEvent::Archived { .. } => "item:archived",
            ItemEvent::Restored { .. } => "item:restored",
            ItemEvent::Deleted { .. } => "item:deleted",
        }
    }

    pub fn item_id(&self) -> &ItemId {
        match self {
            ItemEvent::StatusChanged { id, .. }
            | ItemEvent::Archived { id }
            | ItemEvent::Restored { id }
            | ItemEvent::Deleted { id } => id,
        }
    }

    /// Where the event says the item now lives, if it moved.
    pub fn placement(&self) -> Option<Placement> {
        match self {
            ItemEvent::StatusChanged { .. } => None,
            ItemEvent::Archived { .. } => Some(Placement::In(Partition::Trashed)),
            ItemEvent::Restored { .. } => Some(Placement::In(Partition::Active)),
            ItemEvent::Deleted { .. } => Some(Placement::Gone),
        }
    }
}

/// Known location of an item after a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    In(Partition),
    /// Permanently deleted; belongs to no partition.
    Gone,
}

impl Placement {
    pub fn admits(&self, partition: Partition) -> bool {
        matches!(self, Placement::In(p) if *p == partition)
    }
}

/// Everything the push channel reports to the invalidator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Connected,
    Disconnected { reason: String },
    Event(ItemEvent),
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event: ItemEvent =
            serde_json::from_str(r#"{"type":"item:archived","id":"abc"}"#).unwrap();
        assert_eq!(
            event,
            ItemEvent::Archived {
                id: ItemId::new("abc")
            }
        );
        assert_eq!(event.event_type(), "item:archived");

        let status: ItemEvent = serde_json::from_str(
            r#"{"type":"item:statusChanged","id":"abc","status":"complete"}"#,
        )
        .unwrap();
        assert_eq!(
            status,
            ItemEvent::StatusChanged {
                id: ItemId::new("abc"),
                status: Some(ItemStatus::Complete)
            }
        );
    }

    #[test]
    fn test_status_changed_without_status() {
        let event: ItemEvent =
            serde_json::from_str(r#"{"type":"item:statusChanged","id":"q"}"#).unwrap();
        assert!(event.placement().is_none());
        assert_eq!(event.item_id().as_str(), "q");
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let result = serde_json::from_str::<ItemEvent>(r#"{"type":"item:created","id":"q"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_placement() {
        let archived = ItemEvent::Archived { id: "a".into() };
        assert_eq!(archived.placement(), Some(Placement::In(Partition::Trashed)));
        assert!(Placement::In(Partition::Trashed).admits(Partition::Trashed));
        assert!(!Placement::Gone.admits(Partition::Active));
    }
}
