//! Turns raw frames into typed changes bound to canonical resources.

use std::sync::Arc;

use fleetdeck_protocol::{parse_frame, DecodeError, Frame};
use serde_json::Value;

use crate::resource::ResourceRef;
use crate::store::Store;

#[derive(Debug, Clone)]
pub enum Change {
    Ping,
    Resource(ResourceChange),
    /// Frame with a name nobody handles; not an error.
    Ignored(String),
}

#[derive(Debug, Clone)]
pub struct ResourceChange {
    pub resource_type: String,
    pub resource_id: String,
    /// Canonical instance, already updated with the frame's payload.
    pub resource: ResourceRef,
    pub label: String,
}

pub struct ChangeDecoder {
    store: Arc<dyn Store>,
}

impl ChangeDecoder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn decode(&self, raw: &str) -> Result<Change, DecodeError> {
        let (envelope, frame) = parse_frame(raw)?;
        match frame {
            Frame::Ping => Ok(Change::Ping),
            Frame::Unrecognized(name) => Ok(Change::Ignored(name)),
            Frame::ResourceChange(change) => {
                let mut payload = change.resource;
                if let Some(state) = change.state {
                    payload.insert("state".to_string(), Value::String(state));
                }

                let resource = self.store.typeify(payload).ok_or_else(|| {
                    DecodeError::new(
                        "invalid_resource",
                        format!(
                            "{} {} could not be resolved",
                            change.resource_type, change.resource_id
                        ),
                    )
                })?;

                Ok(Change::Resource(ResourceChange {
                    resource_type: change.resource_type,
                    resource_id: change.resource_id,
                    resource,
                    label: envelope.label(),
                }))
            }
        }
    }
}
