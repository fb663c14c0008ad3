use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

use shared_emr::EmrClient;

use crate::error::ScheduleError;
use crate::models::{parse_instant, AppointmentRecord, AppointmentResource, Bundle, PageCursor};
use crate::services::directory::canonical_practitioner_id;

/// Upstream page size; 50 is the documented maximum.
pub(crate) const PAGE_SIZE: u32 = 50;
const MAX_RETRIES: u32 = 5;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Hard stop so a broken "next" cursor can never loop forever.
pub(crate) const MAX_SAFETY_PAGES: u32 = 1000;

/// Paginated appointment fetcher. The semaphore is the process-wide upstream
/// budget, shared with the directory resolver and every concurrent request
/// path including background prewarms.
#[derive(Clone)]
pub struct AppointmentFetcher {
    limiter: Arc<Semaphore>,
    max_retries: u32,
    base_retry_delay: Duration,
    max_pages: u32,
}

impl AppointmentFetcher {
    pub fn new(limiter: Arc<Semaphore>) -> Self {
        Self {
            limiter,
            max_retries: MAX_RETRIES,
            base_retry_delay: BASE_RETRY_DELAY,
            max_pages: MAX_SAFETY_PAGES,
        }
    }

    /// Override the retry ceiling and base backoff delay. Tests use this to
    /// exercise retry paths without real backoff waits.
    pub fn with_retry_policy(mut self, max_retries: u32, base_retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_retry_delay = base_retry_delay;
        self
    }

    /// Override the pagination safety cap. Tests use this to reach the cap
    /// without a thousand mock pages.
    pub fn with_page_cap(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Fetch an inclusive date range one display-timezone calendar day at a
    /// time, so day boundaries line up with the grid's AM/PM semantics
    /// regardless of the upstream's storage timezone, then merge and dedup.
    pub async fn fetch_days(
        &self,
        client: &EmrClient,
        start_date: NaiveDate,
        end_date: NaiveDate,
        tz: Tz,
    ) -> Result<Vec<AppointmentRecord>, ScheduleError> {
        let mut fetches = Vec::new();
        let mut day = start_date;
        while day <= end_date {
            let (day_start, day_end) = day_bounds_utc(day, tz)?;
            fetches.push(self.fetch_range(client, day_start, day_end));
            day = day
                .succ_opt()
                .ok_or_else(|| ScheduleError::InvalidRange(format!("date out of range: {day}")))?;
        }
        let chunks = try_join_all(fetches).await?;
        Ok(dedup_records(chunks.into_iter().flatten().collect()))
    }

    /// Fetch every appointment whose start falls in `[start, end]` (UTC),
    /// following pagination to completion, then range-filter and dedup.
    ///
    /// Pagination stops on: no next link, an already-visited page number, a
    /// page repeating previously seen content, the safety cap, an empty first
    /// page, or a page whose earliest start is already past `end` (the
    /// upstream returns roughly ascending time order, and may ignore its own
    /// date filter entirely).
    pub async fn fetch_range(
        &self,
        client: &EmrClient,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AppointmentRecord>, ScheduleError> {
        let _permit = self.limiter.acquire().await.unwrap();

        let base_params: Vec<(&str, String)> = vec![
            ("date", format!("ge{}.000Z", start.format("%Y-%m-%dT%H:%M:%S"))),
            ("date", format!("le{}.999Z", end.format("%Y-%m-%dT%H:%M:%S"))),
            ("_count", PAGE_SIZE.to_string()),
        ];

        let mut collected: Vec<AppointmentRecord> = Vec::new();
        let mut cursor: Option<PageCursor> = None;
        let mut seen_pages: HashSet<PageCursor> = HashSet::new();
        let mut seen_keys: HashSet<(DateTime<Utc>, String)> = HashSet::new();
        let mut page_count = 0u32;

        loop {
            page_count += 1;
            if page_count > self.max_pages {
                warn!(
                    "appointment pagination hit the {} page safety cap for {} to {}; stopping",
                    self.max_pages, start, end
                );
                break;
            }
            if let Some(page) = cursor {
                if !seen_pages.insert(page) {
                    warn!(
                        "appointment page {} already visited for {} to {} (pagination loop); stopping",
                        page.0, start, end
                    );
                    break;
                }
            }

            let mut params = base_params.clone();
            if let Some(page) = cursor {
                params.push(("page", page.0.to_string()));
            }

            let bundle: Bundle<AppointmentResource> =
                self.get_page_with_retry(client, "Appointment", &params).await?;
            let entry_count = bundle.entry.len();
            let next = bundle.next_page();
            let page_records: Vec<AppointmentRecord> =
                bundle.resources().filter_map(record_from_resource).collect();

            // A page whose keys were all seen before means the next cursor is
            // broken and we are re-reading old content.
            let page_keys: HashSet<(DateTime<Utc>, String)> = page_records
                .iter()
                .map(|record| (record.start, record.patient_id.clone()))
                .collect();
            if !page_keys.is_empty() && page_keys.is_subset(&seen_keys) {
                warn!(
                    "appointment page repeated previously seen content for {} to {}; stopping",
                    start, end
                );
                break;
            }
            seen_keys.extend(page_keys);

            let page_min_start = page_records.iter().map(|record| record.start).min();
            collected.extend(page_records);

            if let Some(min_start) = page_min_start {
                if min_start > end {
                    debug!("appointment page is entirely past {}; stopping early", end);
                    break;
                }
            }
            if entry_count == 0 && page_count == 1 {
                break;
            }
            match next {
                Some(page) => cursor = Some(page),
                None => break,
            }
        }

        Ok(dedup_records(filter_to_range(collected, start, end)))
    }

    /// One page GET with retry. Network failures and every non-200 status
    /// (429 included) retry with exponential backoff up to the ceiling, then
    /// escalate as a fatal error.
    async fn get_page_with_retry<T: DeserializeOwned>(
        &self,
        client: &EmrClient,
        resource: &str,
        params: &[(&str, String)],
    ) -> Result<T, ScheduleError> {
        let mut attempt = 0u32;
        loop {
            match client.get(resource, params).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        // A body read can still fail mid-transfer; treat it
                        // like any other network error and retry.
                        match response.text().await {
                            Ok(body) => {
                                return serde_json::from_str(&body).map_err(ScheduleError::from);
                            }
                            Err(source) => {
                                if attempt + 1 >= self.max_retries {
                                    return Err(ScheduleError::Network {
                                        attempts: attempt + 1,
                                        source,
                                    });
                                }
                                warn!(
                                    "GET /{} body read failed on attempt {}: {}; retrying",
                                    resource,
                                    attempt + 1,
                                    source
                                );
                            }
                        }
                        sleep(self.base_retry_delay * 2u32.pow(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<no response body>".to_string());
                    if attempt + 1 >= self.max_retries {
                        warn!(
                            "GET /{} returned {} after {} attempts",
                            resource,
                            status,
                            attempt + 1
                        );
                        return Err(ScheduleError::Upstream { status: status.as_u16(), body });
                    }
                    if status.as_u16() == 429 {
                        debug!(
                            "GET /{} rate limited on attempt {}; backing off",
                            resource,
                            attempt + 1
                        );
                    } else {
                        warn!(
                            "GET /{} returned {} on attempt {}; retrying",
                            resource,
                            status,
                            attempt + 1
                        );
                    }
                }
                Err(source) => {
                    if attempt + 1 >= self.max_retries {
                        return Err(ScheduleError::Network { attempts: attempt + 1, source });
                    }
                    warn!(
                        "GET /{} network error on attempt {}: {}; retrying",
                        resource,
                        attempt + 1,
                        source
                    );
                }
            }
            sleep(self.base_retry_delay * 2u32.pow(attempt)).await;
            attempt += 1;
        }
    }
}

/// UTC bounds of one calendar day in the display timezone:
/// `[local 00:00:00, local 23:59:59]`.
fn day_bounds_utc(day: NaiveDate, tz: Tz) -> Result<(DateTime<Utc>, DateTime<Utc>), ScheduleError> {
    let local_start = tz
        .from_local_datetime(&day.and_hms_opt(0, 0, 0).unwrap())
        .earliest()
        .ok_or_else(|| ScheduleError::InvalidRange(format!("no valid local midnight on {day}")))?;
    let local_end = local_start + chrono::Duration::days(1) - chrono::Duration::seconds(1);
    Ok((local_start.with_timezone(&Utc), local_end.with_timezone(&Utc)))
}

/// Drop records outside `[start, end]`; the upstream may ignore its date
/// filter or apply it in a different timezone.
pub fn filter_to_range(
    records: Vec<AppointmentRecord>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<AppointmentRecord> {
    records
        .into_iter()
        .filter(|record| start <= record.start && record.start <= end)
        .collect()
}

/// First-seen dedup on `(start, end, patient_id)`.
pub fn dedup_records(records: Vec<AppointmentRecord>) -> Vec<AppointmentRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.dedup_key()))
        .collect()
}

fn record_from_resource(resource: AppointmentResource) -> Option<AppointmentRecord> {
    let start = parse_instant(resource.start.as_deref()?)?;
    let end = resource.end.as_deref().and_then(parse_instant);

    let mut practitioner_ids = Vec::new();
    let mut location_ids = Vec::new();
    let mut patient_id = None;
    for participant in &resource.participant {
        let Some(actor) = &participant.actor else { continue };
        let reference = actor.reference.as_str();
        let id = reference.rsplit('/').next().unwrap_or_default();
        if id.is_empty() {
            continue;
        }
        if reference.contains("/Practitioner/") {
            practitioner_ids.push(canonical_practitioner_id(id));
        } else if reference.contains("/Location/") {
            location_ids.push(id.to_string());
        } else if reference.contains("/Patient/") && patient_id.is_none() {
            patient_id = Some(id.to_string());
        }
    }

    let (type_code, type_display) = match &resource.appointment_type {
        Some(concept) => {
            let code = concept.coding.first().and_then(|coding| coding.code.clone());
            let display = concept
                .coding
                .first()
                .and_then(|coding| coding.display.clone().or_else(|| coding.text.clone()))
                .or_else(|| concept.text.clone())
                .unwrap_or_default();
            (code, display)
        }
        None => (None, String::new()),
    };

    Some(AppointmentRecord {
        start,
        end,
        patient_id: patient_id.unwrap_or_default(),
        practitioner_ids,
        location_ids,
        type_code,
        type_display,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(start: &str, patient: &str) -> AppointmentRecord {
        AppointmentRecord {
            start: parse_instant(start).unwrap(),
            end: None,
            patient_id: patient.to_string(),
            practitioner_ids: vec![],
            location_ids: vec![],
            type_code: None,
            type_display: String::new(),
        }
    }

    #[test]
    fn dedup_keeps_first_seen() {
        let records = vec![
            record("2024-06-03T15:00:00Z", "p1"),
            record("2024-06-03T15:00:00Z", "p1"),
            record("2024-06-03T15:00:00Z", "p2"),
        ];
        let deduped = dedup_records(records);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].patient_id, "p1");
        assert_eq!(deduped[1].patient_id, "p2");
    }

    #[test]
    fn dedup_is_idempotent() {
        let page = vec![
            record("2024-06-03T15:00:00Z", "p1"),
            record("2024-06-03T16:00:00Z", "p2"),
        ];
        let once = dedup_records(page.clone());
        let twice = dedup_records([page.clone(), page].concat());
        assert_eq!(once, twice);
    }

    #[test]
    fn range_filter_drops_out_of_bounds_starts() {
        let start = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 6, 3, 23, 59, 59).unwrap();
        let records = vec![
            record("2024-06-02T23:59:59Z", "early"),
            record("2024-06-03T00:00:00Z", "lo"),
            record("2024-06-03T23:59:59Z", "hi"),
            record("2024-06-04T00:00:00Z", "late"),
        ];
        let kept = filter_to_range(records, start, end);
        let patients: Vec<&str> = kept.iter().map(|r| r.patient_id.as_str()).collect();
        assert_eq!(patients, vec!["lo", "hi"]);
    }

    #[test]
    fn record_from_resource_extracts_participants_and_type() {
        let resource: AppointmentResource = serde_json::from_value(json!({
            "start": "2024-06-03T15:00:00Z",
            "end": "2024-06-03T15:30:00Z",
            "participant": [
                {"actor": {"reference": "https://emr.example.com/fhir/Patient/p1"}},
                {"actor": {"reference": "https://emr.example.com/fhir/Practitioner/ref|123"}},
                {"actor": {"reference": "https://emr.example.com/fhir/Location/L1"}}
            ],
            "appointmentType": {
                "coding": [{"code": "9449", "display": "Surgery"}]
            }
        }))
        .unwrap();

        let record = record_from_resource(resource).unwrap();
        assert_eq!(record.patient_id, "p1");
        // The ref| prefix is stripped so the id matches the practitioner list.
        assert_eq!(record.practitioner_ids, vec!["123"]);
        assert_eq!(record.location_ids, vec!["L1"]);
        assert_eq!(record.type_code.as_deref(), Some("9449"));
        assert_eq!(record.type_display, "Surgery");
        assert!(record.end.is_some());
    }

    #[test]
    fn record_without_start_is_skipped() {
        let resource: AppointmentResource =
            serde_json::from_value(json!({"participant": []})).unwrap();
        assert!(record_from_resource(resource).is_none());
    }

    #[test]
    fn day_bounds_follow_the_display_timezone() {
        let day = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let (start, end) = day_bounds_utc(day, chrono_tz::America::Los_Angeles).unwrap();
        // PDT is UTC-7 in June.
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 3, 7, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 6, 4, 6, 59, 59).unwrap());
    }
}
