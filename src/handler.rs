//! Request/response contracts for the outer HTTP layer.
//!
//! Routing, authentication and body parsing happen elsewhere. The caller
//! identity passed in here is already checked and is only used in logs.

use crate::bus::EventBus;
use crate::error::{BusError, Result};
use crate::types::{Event, EventId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Body of a publish request.
#[derive(Clone, Debug, Deserialize)]
pub struct PublishRequest {
    pub category: String,
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublishResponse {
    pub success: bool,
    pub id: EventId,
    pub timestamp: Timestamp,
}

/// Parameters of a long-poll request.
#[derive(Clone, Debug, Deserialize)]
pub struct SubscribeRequest {
    #[serde(alias = "category")]
    pub categories: Vec<String>,

    /// Last id already seen; 0 for everything buffered.
    #[serde(default)]
    pub since_id: u64,

    /// Between 1 and the configured maximum when given.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl SubscribeRequest {
    /// The requested timeout, checked against `max`.
    pub fn timeout(&self, max: Duration) -> Result<Option<Duration>> {
        match self.timeout_seconds {
            None => Ok(None),
            Some(0) => Err(BusError::InvalidTimeout(
                "timeout_seconds must be at least 1".into(),
            )),
            Some(secs) if Duration::from_secs(secs) > max => Err(BusError::InvalidTimeout(
                format!("timeout_seconds must be at most {}", max.as_secs()),
            )),
            Some(secs) => Ok(Some(Duration::from_secs(secs))),
        }
    }
}

/// Long-poll result: either events or a timeout marker.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum SubscribeResponse {
    Events { events: Vec<Event> },
    Timeout { timeout: String, timestamp: Timestamp },
}

impl SubscribeResponse {
    /// Events delivered, empty on timeout.
    pub fn events(&self) -> &[Event] {
        match self {
            SubscribeResponse::Events { events } => events.as_slice(),
            SubscribeResponse::Timeout { .. } => &[],
        }
    }
}

/// Latest event per category.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub struct LastEventsResponse(pub HashMap<String, Event>);

/// Error body for rejected requests.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl From<&BusError> for ErrorResponse {
    fn from(err: &BusError) -> Self {
        Self {
            error: err.to_string(),
        }
    }
}

/// Maps requests onto bus operations.
#[derive(Clone)]
pub struct Handlers {
    bus: Arc<EventBus>,
}

impl Handlers {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Publish on behalf of `caller`.
    pub fn publish(&self, caller: &str, request: PublishRequest) -> Result<PublishResponse> {
        match self.bus.publish(&request.category, request.data) {
            Ok(event) => {
                debug!(caller, category = %event.category, id = %event.id, "Published");
                Ok(PublishResponse {
                    success: true,
                    id: event.id,
                    timestamp: event.timestamp,
                })
            }
            Err(e) => {
                warn!(caller, category = %request.category, error = %e, "Publish rejected");
                Err(e)
            }
        }
    }

    /// Long-poll on behalf of `caller`. Blocks until events or timeout.
    pub fn subscribe(&self, caller: &str, request: &SubscribeRequest) -> Result<SubscribeResponse> {
        let timeout = request.timeout(self.bus.config().max_timeout)?;
        let events =
            self.bus
                .subscribe(request.categories.as_slice(), EventId(request.since_id), timeout)?;

        debug!(
            caller,
            categories = ?request.categories,
            since = request.since_id,
            delivered = events.len(),
            "Subscribe finished"
        );

        if events.is_empty() {
            Ok(SubscribeResponse::Timeout {
                timeout: "no events before timeout".to_string(),
                timestamp: Timestamp::now(),
            })
        } else {
            Ok(SubscribeResponse::Events { events })
        }
    }

    /// Latest event of every non-excluded category.
    pub fn last_events(&self, caller: &str) -> LastEventsResponse {
        let latest = self.bus.all_last_events();
        info!(caller, categories = latest.len(), "Listed last events");
        LastEventsResponse(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn handlers(dir: &TempDir) -> Handlers {
        let bus = EventBus::open(BusConfig {
            log_path: dir.path().join("chats.log"),
            max_timeout: Duration::from_secs(5),
            default_timeout: Duration::from_secs(1),
            ..Default::default()
        })
        .unwrap();
        Handlers::new(Arc::new(bus))
    }

    #[test]
    fn test_subscribe_request_parsing() {
        let request: SubscribeRequest =
            serde_json::from_value(json!({"category": ["room1"], "since_id": 4})).unwrap();
        assert_eq!(request.categories, vec!["room1".to_string()]);
        assert_eq!(request.since_id, 4);
        assert!(request.timeout_seconds.is_none());
    }

    #[test]
    fn test_subscribe_timeout_validation() {
        let max = Duration::from_secs(110);
        let request = |secs| SubscribeRequest {
            categories: vec!["room1".into()],
            since_id: 0,
            timeout_seconds: secs,
        };

        assert_eq!(request(None).timeout(max).unwrap(), None);
        assert_eq!(
            request(Some(30)).timeout(max).unwrap(),
            Some(Duration::from_secs(30))
        );
        assert!(matches!(
            request(Some(0)).timeout(max),
            Err(BusError::InvalidTimeout(_))
        ));
        assert!(matches!(
            request(Some(111)).timeout(max),
            Err(BusError::InvalidTimeout(_))
        ));
    }

    #[test]
    fn test_publish_then_subscribe() {
        let dir = TempDir::new().unwrap();
        let handlers = handlers(&dir);

        let published = handlers
            .publish(
                "alice",
                PublishRequest {
                    category: "room1".into(),
                    data: json!({"username": "alice", "msg": "hi"}),
                },
            )
            .unwrap();
        assert!(published.success);
        assert_eq!(published.id, EventId(1));

        let response = handlers
            .subscribe(
                "bob",
                &SubscribeRequest {
                    categories: vec!["room1".into()],
                    since_id: 0,
                    timeout_seconds: Some(1),
                },
            )
            .unwrap();
        assert_eq!(response.events().len(), 1);

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["events"][0]["payload"]["msg"], "hi");
    }

    #[test]
    fn test_subscribe_timeout_body() {
        let dir = TempDir::new().unwrap();
        let handlers = handlers(&dir);

        let response = handlers
            .subscribe(
                "bob",
                &SubscribeRequest {
                    categories: vec!["quiet".into()],
                    since_id: 0,
                    timeout_seconds: Some(1),
                },
            )
            .unwrap();
        assert!(response.events().is_empty());

        let body = serde_json::to_value(&response).unwrap();
        assert!(body.get("timeout").is_some());
        assert!(body.get("events").is_none());
    }

    #[test]
    fn test_publish_invalid_category() {
        let dir = TempDir::new().unwrap();
        let handlers = handlers(&dir);

        let err = handlers
            .publish(
                "alice",
                PublishRequest {
                    category: String::new(),
                    data: json!({}),
                },
            )
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidCategory(_)));
        assert!(ErrorResponse::from(&err).error.contains("Invalid category"));
    }

    #[test]
    fn test_last_events_excludes_mentions() {
        let dir = TempDir::new().unwrap();
        let handlers = handlers(&dir);
        let bus = handlers.bus();

        bus.publish("room1", json!({"msg": "a"})).unwrap();
        bus.publish("_____@alice", json!({"msg": "mentioned"})).unwrap();

        let body = serde_json::to_value(handlers.last_events("alice")).unwrap();
        assert_eq!(body["room1"]["id"], 1);
        assert!(body.get("_____@alice").is_none());
    }
}
