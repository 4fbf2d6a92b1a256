//! TAK server control messages.
//!
//! A streaming connection carries three kinds of traffic: keep-alive pings
//! and their replies, a one-off version announcement from the server, and
//! everything else, which is application data.

use crate::event::{Detail, Event, Point};
use chrono::{Duration, Utc};

/// Event type of a client keep-alive ping.
pub const PING_TYPE: &str = "t-x-c-t";

/// Event type of the server's reply to a ping.
pub const PONG_TYPE: &str = "t-x-c-t-r";

/// Event type of the server's protocol/version announcement.
pub const VERSION_TYPE: &str = "t-x-takp-v";

/// UID carried by client pings.
pub const PING_UID: &str = "takPing";

/// How a ping is generated.
pub const PING_HOW: &str = "h-g-i-g-o";

/// Seconds a ping stays valid.
pub const PING_STALE_SECS: i64 = 20;

/// Classification of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind<'a> {
    /// Reply to a ping; proves the link is alive.
    Pong,
    /// Version announcement. Holds the server version when the event carries
    /// one.
    Version(Option<&'a str>),
    /// Anything else.
    Application,
}

/// Builds a keep-alive ping stamped with the current time.
pub fn ping() -> Event {
    let now = Utc::now();
    Event {
        version: "2.0".to_string(),
        uid: PING_UID.to_string(),
        event_type: PING_TYPE.to_string(),
        time: now,
        start: now,
        stale: now + Duration::seconds(PING_STALE_SECS),
        how: PING_HOW.to_string(),
        point: Point::null_island(),
        detail: Some(Detail::default()),
    }
}

/// Classifies an inbound event by its type.
pub fn classify(event: &Event) -> ControlKind<'_> {
    match event.event_type.as_str() {
        PONG_TYPE => ControlKind::Pong,
        VERSION_TYPE => ControlKind::Version(event.tak_server_version()),
        _ => ControlKind::Application,
    }
}
