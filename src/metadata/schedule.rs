//! Scheduling block stored under a container document's
//! `container_metadata` key: due date, print lifecycle, priority, notes,
//! contacts and external links.
//!
//! Parsing never fails. Unknown enum values fall back to their defaults,
//! unparseable dates are dropped and entries missing their required fields
//! are skipped, so a hand-edited document still loads.

use chrono::{DateTime, NaiveDate};
use serde_json::Value;

use crate::metadata::JsonMap;

/// Document key the scheduling block lives under.
pub const CONTAINER_SCHEDULE_KEY: &str = "container_metadata";

/// Lifecycle state describing whether the container has been printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintedStatus {
    NotStarted,
    InProgress,
    Printed,
    Deprecated,
}

impl PrintedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PrintedStatus::NotStarted => "not_started",
            PrintedStatus::InProgress => "in_progress",
            PrintedStatus::Printed => "printed",
            PrintedStatus::Deprecated => "deprecated",
        }
    }

    pub fn parse(value: &str) -> Option<PrintedStatus> {
        match value.trim().to_lowercase().as_str() {
            "not_started" => Some(PrintedStatus::NotStarted),
            "in_progress" => Some(PrintedStatus::InProgress),
            "printed" => Some(PrintedStatus::Printed),
            "deprecated" => Some(PrintedStatus::Deprecated),
            _ => None,
        }
    }
}

impl Default for PrintedStatus {
    fn default() -> Self {
        PrintedStatus::NotStarted
    }
}

/// Triage priority for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityLevel {
    Low,
    Normal,
    High,
    Urgent,
}

impl PriorityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PriorityLevel::Low => "low",
            PriorityLevel::Normal => "normal",
            PriorityLevel::High => "high",
            PriorityLevel::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<PriorityLevel> {
        match value.trim().to_lowercase().as_str() {
            "low" => Some(PriorityLevel::Low),
            "normal" => Some(PriorityLevel::Normal),
            "high" => Some(PriorityLevel::High),
            "urgent" => Some(PriorityLevel::Urgent),
            _ => None,
        }
    }
}

impl Default for PriorityLevel {
    fn default() -> Self {
        PriorityLevel::Normal
    }
}

/// Primary contact or owner for a container. Only the name is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactEntry {
    pub name: String,
    pub role: Option<String>,
    pub email: Option<String>,
    pub url: Option<String>,
    pub notes: Option<String>,
}

impl ContactEntry {
    fn from_map(payload: &JsonMap) -> Option<ContactEntry> {
        let name = clean_text(payload.get("name"))?;
        Some(ContactEntry {
            name,
            role: clean_text(payload.get("role")),
            email: clean_text(payload.get("email")),
            url: clean_url(payload.get("url")),
            notes: clean_text(payload.get("notes")),
        })
    }

    fn to_map(&self) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("name".to_string(), Value::String(self.name.clone()));
        insert_opt(&mut map, "role", &self.role);
        insert_opt(&mut map, "email", &self.email);
        insert_opt(&mut map, "url", &self.url);
        insert_opt(&mut map, "notes", &self.notes);
        map
    }
}

/// Link to related material such as documentation or a project page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalLink {
    pub label: String,
    pub url: String,
    pub kind: Option<String>,
    pub description: Option<String>,
}

impl ExternalLink {
    fn from_map(payload: &JsonMap) -> Option<ExternalLink> {
        let label = clean_text(payload.get("label"))?;
        let url = clean_url(payload.get("url"))?;
        Some(ExternalLink {
            label,
            url,
            kind: clean_text(payload.get("kind")),
            description: clean_text(payload.get("description")),
        })
    }

    fn to_map(&self) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("label".to_string(), Value::String(self.label.clone()));
        map.insert("url".to_string(), Value::String(self.url.clone()));
        insert_opt(&mut map, "kind", &self.kind);
        insert_opt(&mut map, "description", &self.description);
        map
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSchedule {
    pub due_date: Option<NaiveDate>,
    pub printed_status: PrintedStatus,
    pub priority: PriorityLevel,
    pub notes: Option<String>,
    pub contacts: Vec<ContactEntry>,
    pub external_links: Vec<ExternalLink>,
}

impl ContainerSchedule {
    pub fn from_map(payload: &JsonMap) -> ContainerSchedule {
        ContainerSchedule {
            due_date: parse_due_date(payload.get("due_date")),
            printed_status: payload
                .get("printed_status")
                .and_then(|v| v.as_str())
                .and_then(PrintedStatus::parse)
                .unwrap_or_default(),
            priority: payload
                .get("priority")
                .and_then(|v| v.as_str())
                .and_then(PriorityLevel::parse)
                .unwrap_or_default(),
            notes: clean_text(payload.get("notes")),
            contacts: parse_entry_list(payload.get("contacts"), ContactEntry::from_map),
            external_links: parse_entry_list(payload.get("external_links"), ExternalLink::from_map),
        }
    }

    pub fn to_map(&self) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert(
            "printed_status".to_string(),
            Value::String(self.printed_status.as_str().to_string()),
        );
        map.insert(
            "priority".to_string(),
            Value::String(self.priority.as_str().to_string()),
        );
        map.insert(
            "contacts".to_string(),
            Value::Array(
                self.contacts
                    .iter()
                    .map(|contact| Value::Object(contact.to_map()))
                    .collect(),
            ),
        );
        map.insert(
            "external_links".to_string(),
            Value::Array(
                self.external_links
                    .iter()
                    .map(|link| Value::Object(link.to_map()))
                    .collect(),
            ),
        );
        if let Some(due_date) = self.due_date {
            map.insert(
                "due_date".to_string(),
                Value::String(due_date.format("%Y-%m-%d").to_string()),
            );
        }
        if let Some(ref notes) = self.notes {
            map.insert("notes".to_string(), Value::String(notes.clone()));
        }
        map
    }
}

/// Scheduling block for a full metadata document. Documents written before
/// the block moved under its own key are recognized by their top-level
/// scheduling fields.
pub fn get_container_schedule(metadata: &JsonMap) -> ContainerSchedule {
    if let Some(payload) = metadata
        .get(CONTAINER_SCHEDULE_KEY)
        .and_then(|v| v.as_object())
    {
        return ContainerSchedule::from_map(payload);
    }
    if looks_like_schedule(metadata) {
        return ContainerSchedule::from_map(metadata);
    }
    ContainerSchedule::default()
}

/// Copy of `base` with `schedule` embedded under the scheduling key.
pub fn apply_container_schedule(base: &JsonMap, schedule: &ContainerSchedule) -> JsonMap {
    let mut merged = base.clone();
    merged.insert(
        CONTAINER_SCHEDULE_KEY.to_string(),
        Value::Object(schedule.to_map()),
    );
    merged
}

fn looks_like_schedule(payload: &JsonMap) -> bool {
    [
        "printed_status",
        "priority",
        "contacts",
        "external_links",
        "due_date",
        "notes",
    ]
    .iter()
    .any(|key| payload.contains_key(*key))
}

fn parse_entry_list<T>(value: Option<&Value>, parse: fn(&JsonMap) -> Option<T>) -> Vec<T> {
    match value {
        Some(Value::Object(map)) => parse(map).into_iter().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_object().and_then(parse))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_due_date(value: Option<&Value>) -> Option<NaiveDate> {
    let text = value?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    // Full timestamps collapse to their date part.
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.date_naive())
}

fn clean_text(value: Option<&Value>) -> Option<String> {
    let text = value?.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Accept schemes with an authority part plus `mailto:`; reject bare text
/// and Windows drive paths.
fn clean_url(value: Option<&Value>) -> Option<String> {
    let text = clean_text(value)?;
    let (scheme, rest) = text.split_once(':')?;
    let valid_scheme = scheme
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c));
    if !valid_scheme {
        return None;
    }
    if scheme.eq_ignore_ascii_case("mailto") {
        return Some(text);
    }
    match rest.strip_prefix("//") {
        Some(authority) if !authority.is_empty() => Some(text),
        _ => None,
    }
}

fn insert_opt(map: &mut JsonMap, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        map.insert(key.to_string(), Value::String(value.clone()));
    }
}
