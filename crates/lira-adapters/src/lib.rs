//! Source normalizer contracts + per-source-family implementations.
//!
//! Each source family is a variant implementing [`SourceNormalizer`]; new
//! sources are added as new variants, never by branching inside shared logic.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use lira_core::CanonicalLeadInput;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lira-adapters";

/// A provider-specific payload parser.
///
/// `normalize` is a total function: object- and array-shaped payloads are
/// accepted, unknown or missing fields degrade to empty strings, and malformed
/// input yields an empty list rather than an error.
pub trait SourceNormalizer: Send + Sync {
    fn source_id(&self) -> &str;

    fn normalize(&self, company_id: Uuid, payload: &JsonValue) -> Vec<CanonicalLeadInput>;
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn first_str(value: &JsonValue, keys: &[&str]) -> String {
    for key in keys {
        if let Some(s) = json_str(value, &[key]) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

fn opt_nonempty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Accepts RFC 3339 strings or integer unix seconds; anything else is `None`.
fn parse_timestamp(value: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    match value {
        Some(JsonValue::String(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| s.parse::<i64>().ok().and_then(unix_seconds)),
        Some(JsonValue::Number(n)) => n.as_i64().and_then(unix_seconds),
        _ => None,
    }
}

fn unix_seconds(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Split an object-or-array payload into the per-lead objects it carries.
/// The quarantine pipeline uses this to persist the raw per-lead payload
/// alongside its classified failure.
pub fn payload_items(payload: &JsonValue) -> Vec<&JsonValue> {
    match payload {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Object(_) => vec![payload],
        _ => Vec::new(),
    }
}

fn compose_name(item: &JsonValue) -> String {
    let full = first_str(item, &["full_name", "name"]);
    if !full.is_empty() {
        return full;
    }
    let first = first_str(item, &["first_name"]);
    let last = first_str(item, &["last_name"]);
    match (first.is_empty(), last.is_empty()) {
        (false, false) => format!("{first} {last}"),
        (false, true) => first,
        (true, false) => last,
        (true, true) => String::new(),
    }
}

fn extract_phone(item: &JsonValue) -> String {
    first_str(item, &["phone_number", "phone", "mobile", "contact_number"])
}

/// Paid ad-lead forms. These deliveries carry a stable `leadgen_id` and may
/// pack contact fields into a `field_data` array of `{name, values}` pairs.
#[derive(Debug, Clone, Copy)]
pub struct AdLeadFormNormalizer;

impl AdLeadFormNormalizer {
    fn flatten_field_data(item: &JsonValue) -> BTreeMap<String, String> {
        let mut flat = BTreeMap::new();
        let Some(fields) = item.get("field_data").and_then(|v| v.as_array()) else {
            return flat;
        };
        for field in fields {
            let Some(name) = json_str(field, &["name"]) else {
                continue;
            };
            let value = field
                .get("values")
                .and_then(|v| v.as_array())
                .and_then(|vals| vals.first())
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_string();
            if !value.is_empty() {
                flat.insert(name.to_string(), value);
            }
        }
        flat
    }
}

impl SourceNormalizer for AdLeadFormNormalizer {
    fn source_id(&self) -> &str {
        "ad-form"
    }

    fn normalize(&self, company_id: Uuid, payload: &JsonValue) -> Vec<CanonicalLeadInput> {
        payload_items(payload)
            .into_iter()
            .map(|item| {
                let fields = Self::flatten_field_data(item);
                let from_fields = |keys: &[&str]| -> String {
                    keys.iter()
                        .find_map(|k| fields.get(*k).cloned())
                        .unwrap_or_default()
                };

                let mut input = CanonicalLeadInput::empty(company_id, self.source_id());
                input.external_id =
                    opt_nonempty(first_str(item, &["leadgen_id", "lead_id", "id"]));
                input.name = {
                    let top = compose_name(item);
                    if top.is_empty() {
                        from_fields(&["full_name", "name"])
                    } else {
                        top
                    }
                };
                input.phone = {
                    let top = extract_phone(item);
                    if top.is_empty() {
                        from_fields(&["phone_number", "phone", "mobile"])
                    } else {
                        top
                    }
                };
                input.email = {
                    let top = first_str(item, &["email"]);
                    if top.is_empty() {
                        from_fields(&["email"])
                    } else {
                        top
                    }
                };
                input.campaign_id = first_str(item, &["campaign_id", "campaign_name"]);
                input.form_id = first_str(item, &["form_id"]);
                input.received_at = parse_timestamp(item.get("created_time"));
                for (key, value) in fields {
                    input.metadata.insert(key, value);
                }
                input
            })
            .collect()
    }
}

/// Property-listing portal deliveries, parameterized by portal name.
#[derive(Debug, Clone)]
pub struct ListingPortalNormalizer {
    source: String,
    portal_name: String,
}

impl ListingPortalNormalizer {
    pub fn new(portal_name: impl Into<String>) -> Self {
        let portal_name = portal_name.into();
        Self {
            source: format!("portal-{portal_name}"),
            portal_name,
        }
    }

    pub fn portal_name(&self) -> &str {
        &self.portal_name
    }
}

impl SourceNormalizer for ListingPortalNormalizer {
    fn source_id(&self) -> &str {
        &self.source
    }

    fn normalize(&self, company_id: Uuid, payload: &JsonValue) -> Vec<CanonicalLeadInput> {
        payload_items(payload)
            .into_iter()
            .map(|item| {
                let mut input = CanonicalLeadInput::empty(company_id, self.source.clone());
                input.external_id =
                    opt_nonempty(first_str(item, &["lead_id", "reference", "id"]));
                input.name = {
                    let name = compose_name(item);
                    if name.is_empty() {
                        first_str(item, &["client_name"])
                    } else {
                        name
                    }
                };
                input.phone = extract_phone(item);
                input.email = first_str(item, &["email", "client_email"]);
                input.campaign_id = first_str(item, &["campaign_id"]);
                input.received_at =
                    parse_timestamp(item.get("created_time").or_else(|| item.get("timestamp")));
                let listing = first_str(item, &["listing_id", "property_reference"]);
                if !listing.is_empty() {
                    input.metadata.insert("listing_reference".to_string(), listing);
                }
                let message = first_str(item, &["message", "comment"]);
                if !message.is_empty() {
                    input.metadata.insert("message".to_string(), message);
                }
                input
                    .metadata
                    .insert("portal".to_string(), self.portal_name.clone());
                input
            })
            .collect()
    }
}

/// Embeddable web forms; no stable external id, so dedup falls back to the
/// normalized phone window.
#[derive(Debug, Clone, Copy)]
pub struct WebFormNormalizer;

impl SourceNormalizer for WebFormNormalizer {
    fn source_id(&self) -> &str {
        "web-form"
    }

    fn normalize(&self, company_id: Uuid, payload: &JsonValue) -> Vec<CanonicalLeadInput> {
        payload_items(payload)
            .into_iter()
            .map(|item| {
                let mut input = CanonicalLeadInput::empty(company_id, self.source_id());
                input.name = compose_name(item);
                input.phone = extract_phone(item);
                input.email = first_str(item, &["email"]);
                input.form_id = first_str(item, &["form_id", "form_name"]);
                input.campaign_id = first_str(item, &["campaign_id"]);
                input.received_at = parse_timestamp(item.get("submitted_at"));
                if let Some(obj) = item.as_object() {
                    for (key, value) in obj {
                        if key.starts_with("utm_") {
                            if let Some(s) = value.as_str() {
                                input.metadata.insert(key.clone(), s.to_string());
                            }
                        }
                    }
                }
                input
            })
            .collect()
    }
}

/// Chat-channel handoffs; the conversation id doubles as the external id.
#[derive(Debug, Clone, Copy)]
pub struct ChatNormalizer;

impl SourceNormalizer for ChatNormalizer {
    fn source_id(&self) -> &str {
        "chat"
    }

    fn normalize(&self, company_id: Uuid, payload: &JsonValue) -> Vec<CanonicalLeadInput> {
        payload_items(payload)
            .into_iter()
            .map(|item| {
                let visitor = item.get("visitor").unwrap_or(item);
                let mut input = CanonicalLeadInput::empty(company_id, self.source_id());
                input.external_id = opt_nonempty(first_str(item, &["conversation_id"]));
                input.name = compose_name(visitor);
                input.phone = extract_phone(visitor);
                input.email = first_str(visitor, &["email"]);
                input.received_at = parse_timestamp(item.get("started_at"));
                let channel = first_str(item, &["channel"]);
                if !channel.is_empty() {
                    input.metadata.insert("channel".to_string(), channel);
                }
                input
            })
            .collect()
    }
}

/// Resolve the normalizer for a source id. Ids shaped `portal-<name>` map to a
/// [`ListingPortalNormalizer`] for that portal.
pub fn normalizer_for_source(source_id: &str) -> Option<Box<dyn SourceNormalizer>> {
    match source_id {
        "ad-form" => Some(Box::new(AdLeadFormNormalizer)),
        "web-form" => Some(Box::new(WebFormNormalizer)),
        "chat" => Some(Box::new(ChatNormalizer)),
        other => other
            .strip_prefix("portal-")
            .filter(|name| !name.is_empty())
            .map(|name| Box::new(ListingPortalNormalizer::new(name)) as Box<dyn SourceNormalizer>),
    }
}
