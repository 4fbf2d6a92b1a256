//! XML serialization for CoT messages

use crate::event::{Contact, Detail, Event, Group, Point, TakControl, Takv, Track};
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::escape::escape;
use std::fmt::{self, Write};

/// Serialize an Event to an XML string.
///
/// No XML declaration is written: streamed events are concatenated on one
/// socket and a declaration is only legal at the start of a document.
pub fn serialize_event(event: &Event) -> String {
    let mut xml = String::with_capacity(512);
    // fmt::Write for String is infallible
    let _ = write_event(&mut xml, event);
    xml
}

/// Write an Event as XML into any formatter sink.
pub fn write_event<W: Write>(xml: &mut W, event: &Event) -> fmt::Result {
    write!(
        xml,
        r#"<event version="{}" uid="{}" type="{}" time="{}" start="{}" stale="{}" how="{}">"#,
        escape(&event.version),
        escape(&event.uid),
        escape(&event.event_type),
        timestamp(&event.time),
        timestamp(&event.start),
        timestamp(&event.stale),
        escape(&event.how),
    )?;

    write_point(xml, &event.point)?;

    if let Some(ref detail) = event.detail {
        if detail.is_empty() {
            xml.write_str("<detail/>")?;
        } else {
            xml.write_str("<detail>")?;
            write_detail(xml, detail)?;
            xml.write_str("</detail>")?;
        }
    }

    xml.write_str("</event>")
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn write_point<W: Write>(xml: &mut W, point: &Point) -> fmt::Result {
    write!(
        xml,
        r#"<point lat="{}" lon="{}" hae="{}" ce="{}" le="{}"/>"#,
        point.lat, point.lon, point.hae, point.ce, point.le
    )
}

fn write_detail<W: Write>(xml: &mut W, detail: &Detail) -> fmt::Result {
    if let Some(ref contact) = detail.contact {
        write_contact(xml, contact)?;
    }

    if let Some(ref group) = detail.group {
        write_group(xml, group)?;
    }

    if let Some(ref takv) = detail.takv {
        write_takv(xml, takv)?;
    }

    if let Some(ref track) = detail.track {
        write_track(xml, track)?;
    }

    if let Some(ref control) = detail.tak_control {
        write_tak_control(xml, control)?;
    }

    if let Some(ref remarks) = detail.remarks {
        write!(xml, "<remarks>{}</remarks>", escape(remarks))?;
    }

    // Already well-formed XML captured by the parser
    if let Some(ref xml_detail) = detail.xml_detail {
        xml.write_str(xml_detail)?;
    }

    Ok(())
}

fn write_contact<W: Write>(xml: &mut W, contact: &Contact) -> fmt::Result {
    write!(xml, r#"<contact callsign="{}""#, escape(&contact.callsign))?;
    if let Some(ref endpoint) = contact.endpoint {
        write!(xml, r#" endpoint="{}""#, escape(endpoint))?;
    }
    xml.write_str("/>")
}

fn write_group<W: Write>(xml: &mut W, group: &Group) -> fmt::Result {
    write!(
        xml,
        r#"<__group name="{}" role="{}"/>"#,
        escape(&group.name),
        escape(&group.role)
    )
}

fn write_track<W: Write>(xml: &mut W, track: &Track) -> fmt::Result {
    write!(
        xml,
        r#"<track speed="{}" course="{}"/>"#,
        track.speed, track.course
    )
}

fn write_takv<W: Write>(xml: &mut W, takv: &Takv) -> fmt::Result {
    xml.write_str("<takv")?;
    let attrs = [
        ("device", &takv.device),
        ("platform", &takv.platform),
        ("os", &takv.os),
        ("version", &takv.version),
    ];
    for (name, value) in attrs {
        if let Some(value) = value {
            write!(xml, r#" {}="{}""#, name, escape(value))?;
        }
    }
    xml.write_str("/>")
}

fn write_tak_control<W: Write>(xml: &mut W, control: &TakControl) -> fmt::Result {
    xml.write_str("<TakControl>")?;
    for version in &control.protocol_support {
        write!(xml, r#"<TakProtocolSupport version="{}"/>"#, escape(version))?;
    }
    if let Some(ref info) = control.server_version_info {
        match info.server_version {
            Some(ref version) => write!(
                xml,
                r#"<TakServerVersionInfo serverVersion="{}"/>"#,
                escape(version)
            )?,
            None => xml.write_str("<TakServerVersionInfo/>")?,
        }
    }
    if let Some(status) = control.response_status {
        write!(xml, r#"<TakResponse status="{}"/>"#, status)?;
    }
    xml.write_str("</TakControl>")
}
