use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

// ==============================================================================
// UPSTREAM WIRE TYPES (FHIR-style bundles)
// ==============================================================================

/// One page of an upstream resource list.
///
/// The explicit bound stops serde from inferring `T: Default` for the
/// defaulted fields; the resource types are deliberately not `Default`.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
pub struct Bundle<T> {
    #[serde(default)]
    pub entry: Vec<BundleEntry<T>>,
    #[serde(default)]
    pub link: Vec<BundleLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleEntry<T> {
    pub resource: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleLink {
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub url: String,
}

/// Numeric pagination cursor. Extracted once from the bundle's "next" link;
/// the link URL is never followed verbatim, so the fixed `_count` and date
/// filters stay on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageCursor(pub u32);

impl<T> Bundle<T> {
    pub fn next_page(&self) -> Option<PageCursor> {
        let link = self.link.iter().find(|link| link.relation == "next")?;
        let url = reqwest::Url::parse(&link.url).ok()?;
        let page = url
            .query_pairs()
            .find(|(key, _)| key == "page")
            .and_then(|(_, value)| value.parse().ok())?;
        Some(PageCursor(page))
    }

    pub fn resources(self) -> impl Iterator<Item = T> {
        self.entry.into_iter().filter_map(|entry| entry.resource)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentResource {
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(default)]
    pub participant: Vec<Participant>,
    pub appointment_type: Option<CodeableConcept>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Participant {
    pub actor: Option<Reference>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub reference: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeableConcept {
    #[serde(default)]
    pub coding: Vec<Coding>,
    pub text: Option<String>,
}

/// The upstream has been seen populating `text` where `display` belongs, so
/// both are kept.
#[derive(Debug, Clone, Deserialize)]
pub struct Coding {
    pub code: Option<String>,
    pub display: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PractitionerResource {
    pub resource_type: Option<String>,
    pub id: Option<String>,
    #[serde(default)]
    pub name: Vec<HumanName>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HumanName {
    pub text: Option<String>,
    #[serde(default)]
    pub given: Vec<String>,
    pub family: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationResource {
    pub resource_type: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Parse a FHIR instant; naive timestamps are assumed UTC.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ==============================================================================
// DOMAIN TYPES
// ==============================================================================

/// One appointment as consumed by the aggregator. Immutable once built by the
/// fetch layer.
#[derive(Debug, Clone, PartialEq)]
pub struct AppointmentRecord {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub patient_id: String,
    pub practitioner_ids: Vec<String>,
    pub location_ids: Vec<String>,
    pub type_code: Option<String>,
    pub type_display: String,
}

impl AppointmentRecord {
    /// Dedup identity: two records with the same timing and patient are the
    /// same appointment, whichever page or day-chunk they arrived on.
    pub fn dedup_key(&self) -> (DateTime<Utc>, Option<DateTime<Utc>>, String) {
        (self.start, self.end, self.patient_id.clone())
    }
}

/// `date (YYYY-MM-DD) -> practitioner id -> AM/PM -> slot -> earliest time`.
/// BTreeMaps keep serialization deterministic.
pub type ScheduleGrid = BTreeMap<String, BTreeMap<String, DayBlocks>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DayBlocks {
    #[serde(rename = "AM")]
    pub am: BTreeMap<String, String>,
    #[serde(rename = "PM")]
    pub pm: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurgeryLocation {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleResponse {
    pub schedule: ScheduleGrid,
    pub practitioner_names: HashMap<String, String>,
    pub practitioner_roles: HashMap<String, String>,
    pub practitioner_types: HashMap<String, String>,
    pub location_names: HashMap<String, String>,
    pub surgery_locations: Vec<SurgeryLocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppointmentTypesResponse {
    pub appointment_types: BTreeMap<String, String>,
    pub appointments_scanned: usize,
    pub surgery_location_ids: Vec<String>,
    pub surgery_locations: Vec<SurgeryLocation>,
}
