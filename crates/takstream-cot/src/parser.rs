//! XML parser for CoT events

use crate::event::{
    Contact, Detail, Event, Group, Point, TakControl, TakServerVersionInfo, Takv, Track,
    UNKNOWN_ERROR,
};
use chrono::{DateTime, Utc};
use quick_xml::events::attributes::{AttrError, Attribute};
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("XML parsing error: {0}")]
    XmlError(#[from] quick_xml::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid datetime format: {0}")]
    InvalidDateTime(String),

    #[error("Invalid number format: {0}")]
    InvalidNumber(String),

    #[error("Invalid event structure: {0}")]
    InvalidStructure(String),
}

impl From<AttrError> for ParseError {
    fn from(err: AttrError) -> Self {
        ParseError::XmlError(quick_xml::Error::InvalidAttr(err))
    }
}

/// Parse a CoT message from an XML string
pub fn parse_cot(xml: &str) -> Result<Event, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut version = None;
    let mut uid = None;
    let mut event_type = None;
    let mut time = None;
    let mut start = None;
    let mut stale = None;
    let mut how = None;
    let mut point = None;
    let mut detail = None;
    let mut seen_event = false;

    loop {
        match reader.read_event()? {
            XmlEvent::Start(e) | XmlEvent::Empty(e) if e.name().as_ref() == b"event" => {
                seen_event = true;
                for attr in e.attributes() {
                    let attr = attr?;
                    match attr.key.as_ref() {
                        b"version" => version = Some(attr_string(&attr)?),
                        b"uid" => uid = Some(attr_string(&attr)?),
                        b"type" => event_type = Some(attr_string(&attr)?),
                        b"time" => time = Some(parse_datetime(&attr_string(&attr)?)?),
                        b"start" => start = Some(parse_datetime(&attr_string(&attr)?)?),
                        b"stale" => stale = Some(parse_datetime(&attr_string(&attr)?)?),
                        b"how" => how = Some(attr_string(&attr)?),
                        _ => {}
                    }
                }
            }
            XmlEvent::Start(e) | XmlEvent::Empty(e) if e.name().as_ref() == b"point" => {
                point = Some(parse_point(&e)?);
            }
            XmlEvent::Start(e) if e.name().as_ref() == b"detail" => {
                detail = Some(parse_detail(&mut reader, xml)?);
            }
            XmlEvent::Empty(e) if e.name().as_ref() == b"detail" => {
                detail = Some(Detail::default());
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    if !seen_event {
        return Err(ParseError::InvalidStructure("no <event> element".into()));
    }

    Ok(Event {
        version: version.ok_or_else(|| ParseError::MissingField("version".into()))?,
        uid: uid.ok_or_else(|| ParseError::MissingField("uid".into()))?,
        event_type: event_type.ok_or_else(|| ParseError::MissingField("type".into()))?,
        time: time.ok_or_else(|| ParseError::MissingField("time".into()))?,
        start: start.ok_or_else(|| ParseError::MissingField("start".into()))?,
        stale: stale.ok_or_else(|| ParseError::MissingField("stale".into()))?,
        how: how.ok_or_else(|| ParseError::MissingField("how".into()))?,
        point: point.ok_or_else(|| ParseError::MissingField("point".into()))?,
        detail,
    })
}

fn attr_string(attr: &Attribute<'_>) -> Result<String, ParseError> {
    Ok(attr.unescape_value()?.into_owned())
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, ParseError> {
    s.parse::<DateTime<Utc>>()
        .map_err(|_| ParseError::InvalidDateTime(s.to_string()))
}

fn parse_f64(s: &str) -> Result<f64, ParseError> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| ParseError::InvalidNumber(s.to_string()))
}

fn parse_point(element: &BytesStart<'_>) -> Result<Point, ParseError> {
    let mut lat = None;
    let mut lon = None;
    let mut hae = None;
    let mut ce = None;
    let mut le = None;

    for attr in element.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"lat" => lat = Some(parse_f64(&attr_string(&attr)?)?),
            b"lon" => lon = Some(parse_f64(&attr_string(&attr)?)?),
            b"hae" => hae = Some(parse_f64(&attr_string(&attr)?)?),
            b"ce" => ce = Some(parse_f64(&attr_string(&attr)?)?),
            b"le" => le = Some(parse_f64(&attr_string(&attr)?)?),
            _ => {}
        }
    }

    Ok(Point {
        lat: lat.ok_or_else(|| ParseError::MissingField("lat".into()))?,
        lon: lon.ok_or_else(|| ParseError::MissingField("lon".into()))?,
        hae: hae.unwrap_or(0.0),
        ce: ce.unwrap_or(UNKNOWN_ERROR),
        le: le.unwrap_or(UNKNOWN_ERROR),
    })
}

/// Reads the children of `<detail>` up to and including `</detail>`.
fn parse_detail(reader: &mut Reader<&[u8]>, xml: &str) -> Result<Detail, ParseError> {
    let mut detail = Detail::default();
    let mut xml_fragments = Vec::new();

    loop {
        let element_start = reader.buffer_position() as usize;

        match reader.read_event()? {
            XmlEvent::Start(e) => match e.name().as_ref() {
                b"TakControl" => {
                    detail.tak_control = Some(parse_tak_control(reader)?);
                }
                b"remarks" => {
                    detail.remarks = Some(read_text(reader, b"remarks")?);
                }
                _ => {
                    reader.read_to_end(e.name())?;
                    let element_end = reader.buffer_position() as usize;
                    xml_fragments.push(raw_fragment(xml, element_start, element_end));
                }
            },
            XmlEvent::Empty(e) => match e.name().as_ref() {
                b"contact" => detail.contact = Some(parse_contact(&e)?),
                b"__group" => detail.group = Some(parse_group(&e)?),
                b"track" => detail.track = Some(parse_track(&e)?),
                b"takv" => detail.takv = Some(parse_takv(&e)?),
                b"remarks" => detail.remarks = Some(String::new()),
                b"TakControl" => detail.tak_control = Some(TakControl::default()),
                _ => {
                    let element_end = reader.buffer_position() as usize;
                    xml_fragments.push(raw_fragment(xml, element_start, element_end));
                }
            },
            XmlEvent::End(_) => break,
            XmlEvent::Eof => {
                return Err(ParseError::InvalidStructure("unterminated <detail>".into()));
            }
            _ => {}
        }
    }

    if !xml_fragments.is_empty() {
        detail.xml_detail = Some(xml_fragments.join(""));
    }

    Ok(detail)
}

fn raw_fragment(xml: &str, start: usize, end: usize) -> String {
    xml.get(start..end).unwrap_or_default().trim().to_string()
}

fn read_text(reader: &mut Reader<&[u8]>, tag: &[u8]) -> Result<String, ParseError> {
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            XmlEvent::Text(t) => text.push_str(&t.unescape()?),
            XmlEvent::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            XmlEvent::End(e) if e.name().as_ref() == tag => break,
            XmlEvent::Start(e) => {
                reader.read_to_end(e.name())?;
            }
            XmlEvent::Eof => {
                return Err(ParseError::InvalidStructure(format!(
                    "unterminated <{}>",
                    String::from_utf8_lossy(tag)
                )));
            }
            _ => {}
        }
    }

    Ok(text)
}

fn parse_tak_control(reader: &mut Reader<&[u8]>) -> Result<TakControl, ParseError> {
    let mut control = TakControl::default();
    let mut depth = 1;

    loop {
        match reader.read_event()? {
            XmlEvent::Start(e) => {
                depth += 1;
                apply_tak_control_child(&mut control, &e)?;
            }
            XmlEvent::Empty(e) => apply_tak_control_child(&mut control, &e)?,
            XmlEvent::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            XmlEvent::Eof => {
                return Err(ParseError::InvalidStructure("unterminated <TakControl>".into()));
            }
            _ => {}
        }
    }

    Ok(control)
}

fn apply_tak_control_child(
    control: &mut TakControl,
    element: &BytesStart<'_>,
) -> Result<(), ParseError> {
    match element.name().as_ref() {
        b"TakServerVersionInfo" => {
            let mut info = TakServerVersionInfo::default();
            for attr in element.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"serverVersion" {
                    info.server_version = Some(attr_string(&attr)?);
                }
            }
            control.server_version_info = Some(info);
        }
        b"TakProtocolSupport" => {
            for attr in element.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"version" {
                    control.protocol_support.push(attr_string(&attr)?);
                }
            }
        }
        b"TakResponse" => {
            for attr in element.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"status" {
                    control.response_status = Some(attr_string(&attr)?.eq_ignore_ascii_case("true"));
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn parse_contact(element: &BytesStart<'_>) -> Result<Contact, ParseError> {
    let mut endpoint = None;
    let mut callsign = None;

    for attr in element.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"endpoint" => endpoint = Some(attr_string(&attr)?),
            b"callsign" => callsign = Some(attr_string(&attr)?),
            _ => {}
        }
    }

    Ok(Contact {
        endpoint,
        callsign: callsign.ok_or_else(|| ParseError::MissingField("callsign".into()))?,
    })
}

fn parse_group(element: &BytesStart<'_>) -> Result<Group, ParseError> {
    let mut name = None;
    let mut role = None;

    for attr in element.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"name" => name = Some(attr_string(&attr)?),
            b"role" => role = Some(attr_string(&attr)?),
            _ => {}
        }
    }

    Ok(Group {
        name: name.ok_or_else(|| ParseError::MissingField("group name".into()))?,
        role: role.ok_or_else(|| ParseError::MissingField("group role".into()))?,
    })
}

fn parse_track(element: &BytesStart<'_>) -> Result<Track, ParseError> {
    let mut speed = None;
    let mut course = None;

    for attr in element.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"speed" => speed = Some(parse_f64(&attr_string(&attr)?)?),
            b"course" => course = Some(parse_f64(&attr_string(&attr)?)?),
            _ => {}
        }
    }

    Ok(Track {
        speed: speed.ok_or_else(|| ParseError::MissingField("track speed".into()))?,
        course: course.ok_or_else(|| ParseError::MissingField("track course".into()))?,
    })
}

fn parse_takv(element: &BytesStart<'_>) -> Result<Takv, ParseError> {
    let mut takv = Takv::default();

    for attr in element.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"device" => takv.device = Some(attr_string(&attr)?),
            b"platform" => takv.platform = Some(attr_string(&attr)?),
            b"os" => takv.os = Some(attr_string(&attr)?),
            b"version" => takv.version = Some(attr_string(&attr)?),
            _ => {}
        }
    }

    Ok(takv)
}
