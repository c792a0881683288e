//! Wire types and validation for the resource-change subscription feed.
//!
//! The server pushes one JSON object per frame. This crate only knows the
//! envelope shape; turning embedded payloads into canonical resources is the
//! job of `fleetdeck-core`, which owns the identity map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PING: &str = "ping";
pub const RESOURCE_CHANGE: &str = "resource.change";
pub const MAX_FRAME_BYTES: usize = 1024 * 1024; // 1MB

/// Malformed inbound frame. The connection survives; the frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DecodeError {
    pub code: String,
    pub message: String,
}

impl DecodeError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ping,
    ResourceChange(ResourceChangeFrame),
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceChangeFrame {
    pub resource_type: String,
    pub resource_id: String,
    /// Embedded payload, guaranteed to carry `type` and `id`.
    pub resource: Map<String, Value>,
    pub state: Option<String>,
}

impl Envelope {
    /// `name resourceType resourceId`, the way frames show up in logs.
    pub fn label(&self) -> String {
        let mut label = self.name.clone();
        if let Some(resource_type) = &self.resource_type {
            label.push(' ');
            label.push_str(resource_type);
            if let Some(resource_id) = &self.resource_id {
                label.push(' ');
                label.push_str(resource_id);
            }
        }
        label
    }

    pub fn classify(self) -> Result<Frame, DecodeError> {
        match self.name.as_str() {
            PING => Ok(Frame::Ping),
            RESOURCE_CHANGE => self.into_resource_change().map(Frame::ResourceChange),
            _ => Ok(Frame::Unrecognized(self.name)),
        }
    }

    fn into_resource_change(self) -> Result<ResourceChangeFrame, DecodeError> {
        let resource_type = require_string(self.resource_type, "resourceType")?;

        let mut resource = match self.resource {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(DecodeError::new(
                    "invalid_resource",
                    "resource must be a JSON object",
                ))
            }
            None => return Err(DecodeError::new("missing_field", "resource is required")),
        };

        let embedded_id = resource.get("id").and_then(id_string);
        let resource_id = match (self.resource_id, embedded_id) {
            (Some(id), _) if !id.trim().is_empty() => id,
            (_, Some(id)) => id,
            _ => {
                return Err(DecodeError::new(
                    "missing_field",
                    "resourceId or resource.id is required",
                ))
            }
        };

        resource
            .entry("id")
            .or_insert_with(|| Value::String(resource_id.clone()));
        resource
            .entry("type")
            .or_insert_with(|| Value::String(resource_type.clone()));

        Ok(ResourceChangeFrame {
            resource_type,
            resource_id,
            resource,
            state: self.state.filter(|state| !state.trim().is_empty()),
        })
    }
}

/// Parses and classifies one raw frame.
pub fn parse_frame(raw: &str) -> Result<(Envelope, Frame), DecodeError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::new(
            "frame_too_large",
            "frame exceeded maximum size",
        ));
    }
    if raw.trim().is_empty() {
        return Err(DecodeError::new("empty_frame", "frame body was empty"));
    }

    let envelope: Envelope = serde_json::from_str(raw).map_err(|err| {
        DecodeError::new("invalid_json", format!("frame was not valid JSON: {}", err))
    })?;
    let frame = envelope.clone().classify()?;
    Ok((envelope, frame))
}

/// Resource ids arrive as strings, but older endpoints emit bare numbers.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn require_string(value: Option<String>, field: &str) -> Result<String, DecodeError> {
    match value {
        Some(candidate) if !candidate.trim().is_empty() => Ok(candidate),
        _ => Err(DecodeError::new(
            "missing_field",
            format!("{} is required", field),
        )),
    }
}
