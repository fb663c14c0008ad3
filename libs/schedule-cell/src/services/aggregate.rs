use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{NaiveTime, Timelike};
use chrono_tz::Tz;

use crate::models::{AppointmentRecord, ScheduleGrid};

/// Grid column used when an appointment is classified as surgery.
pub const SURGERY_SLOT_KEY: &str = "Surgery";

/// Appointment type codes that count as surgery
/// (`appointmentType.coding[0].code` upstream).
pub const SURGERY_TYPE_CODES: &[&str] = &["9449"];

const UNKNOWN_KEY: &str = "Unknown";

pub fn is_surgery(record: &AppointmentRecord) -> bool {
    record
        .type_code
        .as_deref()
        .map(str::trim)
        .is_some_and(|code| SURGERY_TYPE_CODES.contains(&code))
}

/// Aggregate records into `date -> practitioner -> AM/PM -> slot -> time`.
/// Surgery appointments land in the reserved [`SURGERY_SLOT_KEY`] column
/// regardless of their location; every cell resolves to the earliest start
/// seen. Pure and deterministic: the grid is rebuilt wholesale on each call.
pub fn aggregate_schedule(records: &[AppointmentRecord], tz: Tz) -> ScheduleGrid {
    // Track the earliest local time per cell and format only at the end, so
    // conflict resolution compares times, not formatted strings.
    let mut earliest: HashMap<(String, String, bool, String), NaiveTime> = HashMap::new();

    for record in records {
        let local = record.start.with_timezone(&tz);
        let date = local.format("%Y-%m-%d").to_string();
        let is_pm = local.hour() >= 12;
        let practitioner = record
            .practitioner_ids
            .first()
            .cloned()
            .unwrap_or_else(|| UNKNOWN_KEY.to_string());
        let slot = if is_surgery(record) {
            SURGERY_SLOT_KEY.to_string()
        } else {
            record
                .location_ids
                .first()
                .cloned()
                .unwrap_or_else(|| UNKNOWN_KEY.to_string())
        };

        let time = local.time();
        earliest
            .entry((date, practitioner, is_pm, slot))
            .and_modify(|existing| {
                if time < *existing {
                    *existing = time;
                }
            })
            .or_insert(time);
    }

    let mut grid = ScheduleGrid::new();
    for ((date, practitioner, is_pm, slot), time) in earliest {
        let blocks = grid.entry(date).or_default().entry(practitioner).or_default();
        let bucket = if is_pm { &mut blocks.pm } else { &mut blocks.am };
        bucket.insert(slot, format_slot_time(time));
    }
    grid
}

/// Map of appointment type code -> display name seen on the records,
/// first-seen display wins, sorted by code.
pub fn appointment_type_names(records: &[AppointmentRecord]) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    for record in records {
        let Some(code) = record
            .type_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
        else {
            continue;
        };
        result.entry(code.to_string()).or_insert_with(|| {
            let display = record.type_display.trim();
            if display.is_empty() {
                "(no display)".to_string()
            } else {
                display.to_string()
            }
        });
    }
    result
}

/// Sorted distinct location ids seen on surgery-classified records.
pub fn surgery_location_ids(records: &[AppointmentRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|record| is_surgery(record))
        .flat_map(|record| &record.location_ids)
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

/// 12-hour "H:MM": zero-padded minutes, no leading zero on the hour, no
/// AM/PM suffix (the bucket already carries it).
fn format_slot_time(time: NaiveTime) -> String {
    let (_, hour12) = time.hour12();
    format!("{}:{:02}", hour12, time.minute())
}
