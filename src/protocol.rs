//! Client-facing message surface.
//!
//! The host owns the actual connection; the engine emits [`ClientCommand`]s
//! through a [`ClientSink`] and consumes [`ClientEvent`]s dispatched by the
//! host. Commands serialize to `{"method": ..., "args": {...}}` records with
//! the method names the client compositor binds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::viewport::Viewport;
use crate::webrtc::RtcSessionPayload;

/// Outbound channel to the client. Implementations must be cheap to call
/// from producer and worker contexts.
pub trait ClientSink: Send + Sync {
    fn send(&self, command: ClientCommand);
}

/// Static description of a layer, sent once when the layer is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerAnnouncement {
    pub id: String,
    pub name: String,
    pub z_index: i32,
    pub target_fps: u32,
    pub is_static: bool,
    /// One of `video`, `custom`, `stream`, `url`, `image`, `derived`.
    pub source_type: String,
    /// `PNG` or `JPEG`.
    pub image_format: String,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub depth: f64,
    pub overscan: u32,
    /// Data URL for static sources, sent up-front.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_content: Option<String>,
}

/// One outbound method call per variant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "args")]
pub enum ClientCommand {
    #[serde(rename = "addLayer")]
    AddLayer(LayerAnnouncement),
    #[serde(rename = "updateLayer")]
    UpdateLayer {
        layer_id: String,
        /// Encoded frame as a data URL.
        data: String,
        metadata: Value,
    },
    #[serde(rename = "updateLayerPosition")]
    UpdateLayerPosition {
        layer_id: String,
        x: Option<i32>,
        y: Option<i32>,
        width: Option<u32>,
        height: Option<u32>,
    },
    #[serde(rename = "removeLayer")]
    RemoveLayer { layer_id: String },
    #[serde(rename = "setLayerMask")]
    SetLayerMask { layer_id: String, mask: String },
    #[serde(rename = "setupWebRTCLayer")]
    SetupWebRtcLayer {
        layer_id: String,
        offer: RtcSessionPayload,
        z_index: i32,
        name: String,
    },
    #[serde(rename = "removeWebRTCLayer")]
    RemoveWebRtcLayer { layer_id: String },
    #[serde(rename = "setSize")]
    SetSize { width: u32, height: u32 },
    #[serde(rename = "setZoom")]
    SetZoom {
        zoom: f64,
        center_x: Option<f64>,
        center_y: Option<f64>,
    },
    #[serde(rename = "resetZoom")]
    ResetZoom,
    #[serde(rename = "updateSvg")]
    UpdateSvg { svg: String },
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "stop")]
    Stop,
}

impl ClientCommand {
    /// The client-side method this command invokes.
    pub fn method(&self) -> &'static str {
        match self {
            ClientCommand::AddLayer(_) => "addLayer",
            ClientCommand::UpdateLayer { .. } => "updateLayer",
            ClientCommand::UpdateLayerPosition { .. } => "updateLayerPosition",
            ClientCommand::RemoveLayer { .. } => "removeLayer",
            ClientCommand::SetLayerMask { .. } => "setLayerMask",
            ClientCommand::SetupWebRtcLayer { .. } => "setupWebRTCLayer",
            ClientCommand::RemoveWebRtcLayer { .. } => "removeWebRTCLayer",
            ClientCommand::SetSize { .. } => "setSize",
            ClientCommand::SetZoom { .. } => "setZoom",
            ClientCommand::ResetZoom => "resetZoom",
            ClientCommand::UpdateSvg { .. } => "updateSvg",
            ClientCommand::Start => "start",
            ClientCommand::Stop => "stop",
        }
    }
}

/// Mouse event coordinates in screen, source and normalized space, plus
/// button/modifier state and the viewport at event time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MouseEventArgs {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default, rename = "sourceX")]
    pub source_x: f64,
    #[serde(default, rename = "sourceY")]
    pub source_y: f64,
    #[serde(default)]
    pub buttons: u32,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub viewport: Option<Viewport>,
}

/// Inbound events originating from the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "args")]
pub enum ClientEvent {
    #[serde(rename = "frame-request")]
    FrameRequest { layer_id: String },
    #[serde(rename = "mouse-move")]
    MouseMove(MouseEventArgs),
    #[serde(rename = "mouse-click")]
    MouseClick(MouseEventArgs),
    #[serde(rename = "viewport-change")]
    ViewportChange(Viewport),
    #[serde(rename = "size-changed")]
    SizeChanged { width: u32, height: u32 },
    #[serde(rename = "component-ready")]
    ComponentReady,
    #[serde(rename = "webrtc-answer")]
    WebRtcAnswer {
        layer_id: String,
        answer: RtcSessionPayload,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_serialize_with_method_names() {
        let command = ClientCommand::UpdateLayer {
            layer_id: "layer-1".into(),
            data: "data:image/jpeg;base64,x".into(),
            metadata: json!({"frame_id": 1}),
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["method"], "updateLayer");
        assert_eq!(value["args"]["layer_id"], "layer-1");
        assert_eq!(value["args"]["metadata"]["frame_id"], 1);
    }

    #[test]
    fn webrtc_setup_uses_exact_method_name() {
        let command = ClientCommand::SetupWebRtcLayer {
            layer_id: "w1".into(),
            offer: RtcSessionPayload {
                sdp: "v=0".into(),
                kind: "offer".into(),
            },
            z_index: 3,
            name: "WebRTC-3".into(),
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["method"], "setupWebRTCLayer");
        assert_eq!(value["args"]["offer"]["type"], "offer");
        assert_eq!(command.method(), "setupWebRTCLayer");
    }

    #[test]
    fn announcement_omits_absent_static_content() {
        let announcement = LayerAnnouncement {
            id: "layer-1".into(),
            name: "Layer 0".into(),
            z_index: 0,
            target_fps: 60,
            is_static: false,
            source_type: "video".into(),
            image_format: "JPEG".into(),
            x: None,
            y: None,
            width: None,
            height: None,
            depth: 1.0,
            overscan: 0,
            static_content: None,
        };
        let value = serde_json::to_value(&announcement).unwrap();
        assert!(value.get("static_content").is_none());
        // Geometry nulls stay present so the client sees "fill canvas".
        assert!(value["x"].is_null());
    }

    #[test]
    fn events_deserialize_from_tagged_json() {
        let event: ClientEvent =
            serde_json::from_value(json!({"event": "frame-request", "args": {"layer_id": "layer-2"}}))
                .unwrap();
        match event {
            ClientEvent::FrameRequest { layer_id } => assert_eq!(layer_id, "layer-2"),
            other => panic!("unexpected event {other:?}"),
        }

        let event: ClientEvent = serde_json::from_value(json!({
            "event": "viewport-change",
            "args": {"x": 0.1, "y": 0.2, "width": 0.5, "height": 0.5, "zoom": 2.0}
        }))
        .unwrap();
        match event {
            ClientEvent::ViewportChange(viewport) => assert_eq!(viewport.zoom, 2.0),
            other => panic!("unexpected event {other:?}"),
        }

        let event: ClientEvent =
            serde_json::from_value(json!({"event": "component-ready"})).unwrap();
        assert!(matches!(event, ClientEvent::ComponentReady));
    }

    #[test]
    fn mouse_event_fills_missing_fields() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "mouse-move",
            "args": {"x": 10.0, "y": 20.0, "sourceX": 40.0, "sourceY": 80.0, "buttons": 1}
        }))
        .unwrap();
        match event {
            ClientEvent::MouseMove(args) => {
                assert_eq!(args.source_x, 40.0);
                assert_eq!(args.buttons, 1);
                assert!(!args.shift);
                assert!(args.viewport.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
