//! Replay wire envelope
//!
//! Every replay event is a `$snapshot` event whose `$snapshot_data` is a
//! one-element array: `type: 2` carries a wireframe with the base64 image,
//! `type: 4` announces viewport dimensions and screen name. Meta events are
//! placed before snapshots within a batch.

use serde_json::{json, Value};

use crate::event::{Event, LIB_NAME, LIB_VERSION};

/// One buffered screen capture, already compressed and base64-encoded
#[derive(Debug, Clone)]
pub(crate) struct SnapshotFrame {
    pub base64: String,
    pub id: i64,
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
    pub timestamp: i64,
}

/// One buffered viewport announcement
#[derive(Debug, Clone)]
pub(crate) struct MetaFrame {
    pub width: i64,
    pub height: i64,
    pub screen: String,
    pub timestamp: i64,
}

fn base_properties(session_id: &str, width: i64, height: i64) -> Value {
    json!({
        "$snapshot_source": "mobile",
        "$session_id": session_id,
        "$window_id": "main",
        "$lib": LIB_NAME,
        "$lib_version": LIB_VERSION,
        "$device_type": "Mobile",
        "$os": "Linux",
        "$screen_width": width,
        "$screen_height": height,
    })
}

/// Build the `$snapshot` event for a captured frame (type 2, one wireframe).
pub(crate) fn snapshot_event(frame: &SnapshotFrame, distinct_id: &str, session_id: &str) -> Event {
    let mut properties = base_properties(session_id, frame.width as i64, frame.height as i64);
    properties["$snapshot_data"] = json!([{
        "type": 2,
        "data": {
            "initialOffset": {"top": 0, "left": 0},
            "wireframes": [{
                "id": frame.id,
                "x": frame.x,
                "y": frame.y,
                "width": frame.width,
                "height": frame.height,
                "type": "screenshot",
                "base64": frame.base64,
                "style": {},
            }],
            "timestamp": frame.timestamp,
        },
        "timestamp": frame.timestamp,
    }]);

    Event {
        event: "$snapshot".to_string(),
        distinct_id: distinct_id.to_string(),
        timestamp: frame.timestamp,
        properties,
    }
}

/// Build the `$snapshot` meta event for a viewport change (type 4).
pub(crate) fn meta_event(frame: &MetaFrame, distinct_id: &str, session_id: &str) -> Event {
    let mut properties = base_properties(session_id, frame.width, frame.height);
    properties["$snapshot_data"] = json!([{
        "type": 4,
        "data": {
            "href": frame.screen,
            "width": frame.width,
            "height": frame.height,
        },
        "timestamp": frame.timestamp,
    }]);

    Event {
        event: "$snapshot".to_string(),
        distinct_id: distinct_id.to_string(),
        timestamp: frame.timestamp,
        properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_event_envelope() {
        let frame = SnapshotFrame {
            base64: "aGVsbG8=".to_string(),
            id: 7,
            x: 1,
            y: 2,
            width: 800,
            height: 600,
            timestamp: 1700000000123,
        };

        let event = snapshot_event(&frame, "user-1", "sess-1");
        assert_eq!(event.event, "$snapshot");
        assert_eq!(event.distinct_id, "user-1");

        let data = &event.properties["$snapshot_data"];
        assert_eq!(data.as_array().unwrap().len(), 1);
        assert_eq!(data[0]["type"], 2);

        let wireframe = &data[0]["data"]["wireframes"][0];
        assert_eq!(wireframe["id"], 7);
        assert_eq!(wireframe["type"], "screenshot");
        assert_eq!(wireframe["base64"], "aGVsbG8=");
        assert_eq!(data[0]["data"]["initialOffset"]["top"], 0);

        assert_eq!(event.properties["$session_id"], "sess-1");
        assert_eq!(event.properties["$window_id"], "main");
        assert_eq!(event.properties["$snapshot_source"], "mobile");
        assert_eq!(event.properties["$screen_width"], 800);
    }

    #[test]
    fn test_meta_event_envelope() {
        let frame = MetaFrame {
            width: 1024,
            height: 768,
            screen: "home".to_string(),
            timestamp: 5,
        };

        let event = meta_event(&frame, "user-1", "sess-1");
        let data = &event.properties["$snapshot_data"];
        assert_eq!(data[0]["type"], 4);
        assert_eq!(data[0]["data"]["href"], "home");
        assert_eq!(data[0]["data"]["width"], 1024);
        assert_eq!(data[0]["data"]["height"], 768);
    }

    #[test]
    fn test_wire_timestamp_is_string() {
        let frame = MetaFrame {
            width: 1,
            height: 1,
            screen: String::new(),
            timestamp: 99,
        };
        let event = meta_event(&frame, "user-1", "sess-1");
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["timestamp"], "99");
    }
}
