//! CoT event structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// CoT Event represents a Cursor on Target message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// CoT version (typically "2.0")
    pub version: String,
    /// Unique identifier for this event
    pub uid: String,
    /// CoT type (e.g., "a-f-G" for atom-friendly-ground)
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event timestamp
    pub time: DateTime<Utc>,
    /// Event start time
    pub start: DateTime<Utc>,
    /// Event stale time (when the event becomes invalid)
    pub stale: DateTime<Utc>,
    /// How the event was generated (e.g., "h-e" for human-entered)
    pub how: String,
    /// Geographic location and accuracy
    pub point: Point,
    /// Optional detail section
    pub detail: Option<Detail>,
}

/// Geographic point with accuracy metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Latitude in decimal degrees (-90 to 90)
    pub lat: f64,
    /// Longitude in decimal degrees (-180 to 180)
    pub lon: f64,
    /// Height above ellipsoid in meters
    pub hae: f64,
    /// Circular error in meters (95% confidence)
    pub ce: f64,
    /// Linear error in meters (95% confidence)
    pub le: f64,
}

/// Sentinel for unknown accuracy / altitude
pub const UNKNOWN_ERROR: f64 = 9999999.0;

impl Point {
    /// Create a new Point with default accuracy values
    pub fn new(lat: f64, lon: f64, hae: f64) -> Self {
        Self {
            lat,
            lon,
            hae,
            ce: UNKNOWN_ERROR,
            le: UNKNOWN_ERROR,
        }
    }

    /// The 0,0 point control messages carry
    pub fn null_island() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

/// Detail section.
///
/// Elements the parser does not model are kept verbatim in `xml_detail` and
/// written back out by the serializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Detail {
    /// Contact information
    pub contact: Option<Contact>,
    /// Group membership
    pub group: Option<Group>,
    /// Client software version
    pub takv: Option<Takv>,
    /// Movement
    pub track: Option<Track>,
    /// Free-text remarks
    pub remarks: Option<String>,
    /// Server control block
    pub tak_control: Option<TakControl>,
    /// Unmodelled elements, verbatim
    pub xml_detail: Option<String>,
}

impl Detail {
    /// Check if the detail is empty
    pub fn is_empty(&self) -> bool {
        self.contact.is_none()
            && self.group.is_none()
            && self.takv.is_none()
            && self.track.is_none()
            && self.remarks.is_none()
            && self.tak_control.is_none()
            && self.xml_detail.is_none()
    }
}

/// Contact information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Optional endpoint for communication
    pub endpoint: Option<String>,
    /// Callsign for display
    pub callsign: String,
}

/// Group information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group name
    pub name: String,
    /// Group role
    pub role: String,
}

/// Track information for moving entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Speed in meters per second
    pub speed: f64,
    /// Course/heading in degrees (0-360)
    pub course: f64,
}

/// TAK version and device information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Takv {
    pub device: Option<String>,
    pub platform: Option<String>,
    pub os: Option<String>,
    pub version: Option<String>,
}

/// `<TakControl>` block sent by TAK servers during protocol negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TakControl {
    /// `<TakProtocolSupport version="..."/>` entries
    pub protocol_support: Vec<String>,
    /// `<TakServerVersionInfo serverVersion="..."/>`
    pub server_version_info: Option<TakServerVersionInfo>,
    /// `<TakResponse status="..."/>`
    pub response_status: Option<bool>,
}

/// Server version announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TakServerVersionInfo {
    pub server_version: Option<String>,
}

impl Event {
    /// Get the callsign from the contact detail, if present
    pub fn callsign(&self) -> Option<&str> {
        self.detail
            .as_ref()
            .and_then(|d| d.contact.as_ref())
            .map(|c| c.callsign.as_str())
    }

    /// Get the remarks text, if present
    pub fn remarks(&self) -> Option<&str> {
        self.detail.as_ref().and_then(|d| d.remarks.as_deref())
    }

    /// `detail/TakControl/TakServerVersionInfo@serverVersion`, if present
    pub fn tak_server_version(&self) -> Option<&str> {
        self.detail
            .as_ref()
            .and_then(|d| d.tak_control.as_ref())
            .and_then(|c| c.server_version_info.as_ref())
            .and_then(|v| v.server_version.as_deref())
    }
}
