//! XMLTV schedule parser
//!
//! Extracts a single channel's programmes from an XMLTV document:
//! - Loose channel matching (upstream ids are inconsistently namespaced)
//! - Compact timestamps (`YYYYMMDDHHMMSS[ tz]`) read as local time
//! - Invalid programmes are dropped, the result is sorted by start
//!
//! Also generates the synthetic placeholder schedule used when no real
//! data can be obtained.

use std::borrow::Cow;
use std::io::Read;

use chrono::{DateTime, DurationRound, Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::debug;

use crate::epg::error::EpgError;
use crate::epg::models::ScheduleEntry;

/// Title used when a programme's title element is blank
const PLACEHOLDER_TITLE: &str = "Untitled Programme";

/// Synthetic schedule window, in hours relative to the current hour
const SYNTHETIC_HOURS_BEFORE: i64 = 2;
const SYNTHETIC_HOURS_AFTER: i64 = 10;

/// Parse `document` for `channel_key`, returning an empty list on any failure
pub fn parse_schedule(document: &str, channel_key: &str) -> Vec<ScheduleEntry> {
    match try_parse_schedule(document, channel_key) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("No schedule parsed for {}: {}", channel_key, e);
            Vec::new()
        }
    }
}

/// Parse `document` for `channel_key`, reporting why nothing was found
pub fn try_parse_schedule(document: &str, channel_key: &str) -> Result<Vec<ScheduleEntry>, EpgError> {
    try_parse_schedule_in(document, channel_key, &Local)
}

/// `try_parse_schedule` with timestamps read as wall-clock time in `tz`
pub(crate) fn try_parse_schedule_in<Tz: TimeZone>(
    document: &str,
    channel_key: &str,
    tz: &Tz,
) -> Result<Vec<ScheduleEntry>, EpgError> {
    let matcher = ChannelMatcher::new(channel_key);
    let mut reader = Reader::from_str(document);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut channel_found = false;
    let mut saw_element = false;
    let mut depth: usize = 0;

    let mut current: Option<ProgrammeDraft> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                saw_element = true;
                depth += 1;
                match e.name().as_ref() {
                    b"channel" if current.is_none() => {
                        if attribute(&reader, &e, b"id").is_some_and(|id| matcher.matches(&id)) {
                            channel_found = true;
                        }
                    }
                    b"programme" => {
                        current = Some(ProgrammeDraft::from_element(&reader, &e, &matcher, tz));
                    }
                    b"title" | b"desc" => {
                        if let Some(ref draft) = current {
                            let next = if e.name().as_ref() == b"title" { Field::Title } else { Field::Desc };
                            // Only the first title/desc counts, later ones are usually translations
                            if draft.wants(next) {
                                field = Some(next);
                                text.clear();
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                saw_element = true;
                match e.name().as_ref() {
                    b"channel" if current.is_none() => {
                        if attribute(&reader, &e, b"id").is_some_and(|id| matcher.matches(&id)) {
                            channel_found = true;
                        }
                    }
                    b"title" => {
                        if let Some(ref mut draft) = current {
                            if draft.wants(Field::Title) {
                                draft.title = Some(String::new());
                            }
                        }
                    }
                    // A self-closed programme has no title, so it can never be kept
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if field.is_some() {
                    let chunk = e
                        .unescape()
                        .unwrap_or_else(|_| Cow::Owned(String::from_utf8_lossy(&e).into_owned()));
                    text.push_str(&chunk);
                }
            }
            Ok(Event::CData(e)) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Ok(Event::End(e)) => {
                depth = depth.saturating_sub(1);
                match e.name().as_ref() {
                    b"programme" => {
                        if let Some(draft) = current.take() {
                            if let Some(entry) = draft.finish(channel_key) {
                                entries.push(entry);
                            }
                        }
                        field = None;
                    }
                    b"title" if field == Some(Field::Title) => {
                        if let Some(ref mut draft) = current {
                            draft.title = Some(text.trim().to_string());
                        }
                        field = None;
                    }
                    b"desc" if field == Some(Field::Desc) => {
                        if let Some(ref mut draft) = current {
                            draft.description = Some(text.trim().to_string());
                        }
                        field = None;
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EpgError::Parse(format!(
                    "XML error at byte {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
            _ => {}
        }
    }

    if !saw_element {
        return Err(EpgError::Parse("document contains no elements".to_string()));
    }
    if depth != 0 {
        return Err(EpgError::Parse("unexpected end of document".to_string()));
    }
    if !channel_found {
        return Err(EpgError::NotFoundInDocument {
            channel: channel_key.to_string(),
        });
    }

    entries.sort_by_key(|entry| entry.start);
    Ok(entries)
}

/// Inflate gzip payloads (magic `1f 8b`) and decode the body as text
pub fn decode_document(body: &[u8]) -> Result<String, EpgError> {
    if body.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(body);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| EpgError::Parse(format!("gzip decode failed: {}", e)))?;
        return Ok(String::from_utf8_lossy(&raw).into_owned());
    }
    Ok(String::from_utf8_lossy(body).into_owned())
}

// ============================================================================
// Identifier matching
// ============================================================================

/// True when `key` appears inside `document_id` on token boundaries.
///
/// Comparison is case-insensitive. `"bbc1"` overlaps `"bbc1.uk"` and
/// `"uk.bbc1"`, while `"bbc"` does not overlap `"bbc1.uk"`. An empty key
/// never overlaps anything.
pub fn identifiers_overlap(document_id: &str, key: &str) -> bool {
    ChannelMatcher::new(key).matches(document_id)
}

struct ChannelMatcher {
    key: String,
}

impl ChannelMatcher {
    fn new(key: &str) -> Self {
        Self {
            key: key.trim().to_lowercase(),
        }
    }

    fn matches(&self, document_id: &str) -> bool {
        if self.key.is_empty() {
            return false;
        }
        let id = document_id.trim().to_lowercase();
        id.match_indices(self.key.as_str()).any(|(pos, matched)| {
            let before = id[..pos].chars().next_back();
            let after = id[pos + matched.len()..].chars().next();
            is_boundary(before) && is_boundary(after)
        })
    }
}

fn is_boundary(c: Option<char>) -> bool {
    c.map_or(true, |c| !c.is_alphanumeric())
}

// ============================================================================
// Programme assembly
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Title,
    Desc,
}

/// A programme element being read
struct ProgrammeDraft {
    matches: bool,
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
    title: Option<String>,
    description: Option<String>,
}

impl ProgrammeDraft {
    fn from_element<Tz: TimeZone>(
        reader: &Reader<&[u8]>,
        e: &BytesStart,
        matcher: &ChannelMatcher,
        tz: &Tz,
    ) -> Self {
        let matches = attribute(reader, e, b"channel").is_some_and(|id| matcher.matches(&id));
        if !matches {
            return Self {
                matches,
                start: None,
                stop: None,
                title: None,
                description: None,
            };
        }

        Self {
            matches,
            start: attribute(reader, e, b"start").and_then(|s| parse_xmltv_time_in(&s, tz)),
            stop: attribute(reader, e, b"stop").and_then(|s| parse_xmltv_time_in(&s, tz)),
            title: None,
            description: None,
        }
    }

    fn wants(&self, field: Field) -> bool {
        self.matches
            && match field {
                Field::Title => self.title.is_none(),
                Field::Desc => self.description.is_none(),
            }
    }

    fn finish(self, channel_key: &str) -> Option<ScheduleEntry> {
        if !self.matches {
            return None;
        }

        let title = self.title?;
        let entry = ScheduleEntry {
            title: if title.is_empty() { PLACEHOLDER_TITLE.to_string() } else { title },
            description: self.description.unwrap_or_default(),
            start: self.start?,
            end: self.stop?,
            channel_key: channel_key.to_string(),
        };

        entry.is_valid().then_some(entry)
    }
}

/// Get an unescaped attribute value from an element
fn attribute(reader: &Reader<&[u8]>, e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .and_then(|attr| attr.decode_and_unescape_value(reader.decoder()).ok())
        .map(|value| value.into_owned())
}

/// Parse XMLTV time "20240115120000 +0000" as wall-clock time in `tz`.
///
/// Only the first 14 characters are significant; the offset suffix is
/// ignored on purpose.
pub(crate) fn parse_xmltv_time_in<Tz: TimeZone>(value: &str, tz: &Tz) -> Option<DateTime<Utc>> {
    let digits = value.trim().get(..14)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S").ok()?;
    let local = match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t,
        // Repeated hour when clocks go back: take the first occurrence
        LocalResult::Ambiguous(first, _) => first,
        // Skipped hour when clocks go forward: shift past the gap
        LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()?,
    };
    Some(local.with_timezone(&Utc))
}

// ============================================================================
// Synthetic schedule
// ============================================================================

/// Placeholder schedule around the current hour; never empty
pub fn generate_synthetic(channel_key: &str) -> Vec<ScheduleEntry> {
    generate_synthetic_at(channel_key, Utc::now())
}

pub(crate) fn generate_synthetic_at(channel_key: &str, now: DateTime<Utc>) -> Vec<ScheduleEntry> {
    let hour = chrono::Duration::hours(1);
    let current_hour = now.duration_trunc(hour).unwrap_or(now);
    let description = format!("Guide data is not available for {}", channel_key);

    (-SYNTHETIC_HOURS_BEFORE..SYNTHETIC_HOURS_AFTER)
        .map(|offset| {
            let start = current_hour + hour * offset as i32;
            let title = match offset {
                -1 => "Movie Matinee",
                0 => "News Now",
                1 => "Sports Tonight",
                _ => "Scheduled Programming",
            };
            ScheduleEntry {
                title: title.to_string(),
                description: description.clone(),
                start,
                end: start + hour,
                channel_key: channel_key.to_string(),
            }
        })
        .collect()
}
