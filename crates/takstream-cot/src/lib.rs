//! Cursor on Target (CoT) messages for TAK streaming clients
//!
//! This crate parses and serializes the XML CoT events exchanged with a TAK
//! server, and knows the handful of control messages a streaming connection
//! uses to stay alive and learn the server version.
//!
//! # Example
//!
//! ```rust
//! use takstream_cot::{classify, parse_cot, ControlKind};
//!
//! let cot_xml = r#"<event version="2.0" uid="takPong" type="t-x-c-t-r"
//!        time="2024-01-15T10:30:00Z"
//!        start="2024-01-15T10:30:00Z"
//!        stale="2024-01-15T10:30:20Z" how="h-g-i-g-o">
//!     <point lat="0.0" lon="0.0" hae="0.0" ce="9999999" le="9999999"/>
//! </event>"#;
//!
//! let event = parse_cot(cot_xml).expect("Failed to parse CoT");
//! assert_eq!(classify(&event), ControlKind::Pong);
//! ```

pub mod control;
pub mod event;
pub mod parser;
pub mod serializer;

pub use control::{classify, ping, ControlKind, PING_TYPE, PONG_TYPE, VERSION_TYPE};
pub use event::{Contact, Detail, Event, Group, Point, TakControl, TakServerVersionInfo, Takv, Track};
pub use parser::{parse_cot, ParseError};
pub use serializer::{serialize_event, write_event};
