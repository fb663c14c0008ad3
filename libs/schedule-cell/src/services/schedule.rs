use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use shared_config::AppConfig;
use shared_emr::EmrClient;

use crate::error::ScheduleError;
use crate::models::{
    AppointmentRecord, AppointmentTypesResponse, ScheduleGrid, ScheduleResponse, SurgeryLocation,
};
use crate::services::aggregate::{aggregate_schedule, appointment_type_names, surgery_location_ids};
use crate::services::directory::{DirectoryMaps, DirectoryResolver};
use crate::services::fetch::{dedup_records, AppointmentFetcher};

/// One tenant's cached window. Replaced wholesale on refresh, never mutated
/// across a stale boundary; readers holding the old Arc are unaffected.
struct WindowEntry {
    window_start: NaiveDate,
    window_end: NaiveDate,
    records: Arc<Vec<AppointmentRecord>>,
    grid: Arc<ScheduleGrid>,
    cached_at: Instant,
}

/// Appointment retrieval and schedule aggregation engine. Construct once per
/// process: every tenant and request path (foreground and prewarm) shares its
/// upstream budget and caches. Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct ScheduleService {
    display_tz: Tz,
    window_weeks: u32,
    window_ttl: Duration,
    fetcher: AppointmentFetcher,
    directory: Arc<DirectoryResolver>,
    windows: Arc<RwLock<HashMap<String, Arc<WindowEntry>>>>,
}

impl ScheduleService {
    pub fn new(config: &AppConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_upstream_requests));
        Self {
            display_tz: config.display_timezone,
            window_weeks: config.schedule_cache_window_weeks,
            window_ttl: Duration::from_secs(config.schedule_cache_ttl_seconds),
            fetcher: AppointmentFetcher::new(limiter.clone()),
            directory: Arc::new(DirectoryResolver::new(
                limiter,
                Duration::from_secs(config.directory_cache_ttl_seconds),
            )),
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Practitioner schedule grid for an inclusive date range, with
    /// directory names merged in.
    ///
    /// Ranges inside the rolling cache window are served from the warm cache
    /// when possible; a cold or stale cache answers with a direct fetch of
    /// just the requested sub-range and kicks off a background refresh of the
    /// full window. Ranges outside the window always fetch directly and leave
    /// the cache untouched.
    pub async fn get_schedule(
        &self,
        client: &EmrClient,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<ScheduleResponse, ScheduleError> {
        if start_date > end_date {
            return Err(ScheduleError::InvalidRange(format!(
                "start {start_date} is after end {end_date}"
            )));
        }

        let (window_start, window_end) = self.window_bounds();
        let in_window = window_start <= start_date && end_date <= window_end;

        let (records, schedule) = if in_window {
            match self.cached_window(client.base_url(), window_start, window_end).await {
                Some(entry) => {
                    debug!(
                        "serving {} to {} from warm window cache for {}",
                        start_date,
                        end_date,
                        client.base_url()
                    );
                    self.slice_window(&entry, start_date, end_date)
                }
                None => {
                    // Staged load: answer with just the requested slice, then
                    // refresh the whole window off the request path.
                    let records = self
                        .fetcher
                        .fetch_days(client, start_date, end_date, self.display_tz)
                        .await?;
                    let schedule = aggregate_schedule(&records, self.display_tz);
                    self.trigger_prewarm(client, window_start, window_end);
                    (records, schedule)
                }
            }
        } else {
            let records = self
                .fetcher
                .fetch_days(client, start_date, end_date, self.display_tz)
                .await?;
            let schedule = aggregate_schedule(&records, self.display_tz);
            (records, schedule)
        };

        let directory = self.directory.resolve(client).await;
        let surgery_locations = resolve_surgery_locations(&records, &directory);

        Ok(ScheduleResponse {
            schedule,
            practitioner_names: directory.practitioner_names.clone(),
            practitioner_roles: directory.practitioner_roles.clone(),
            practitioner_types: directory.practitioner_types.clone(),
            location_names: directory.location_names.clone(),
            surgery_locations,
        })
    }

    /// Appointment type codes and display names seen in a date range,
    /// defaulting to the last seven days, scanned one day at a time.
    pub async fn get_appointment_types(
        &self,
        client: &EmrClient,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<AppointmentTypesResponse, ScheduleError> {
        let end = end_date.unwrap_or_else(|| self.today());
        let start = start_date.unwrap_or_else(|| end - chrono::Duration::days(7));
        if start > end {
            return Err(ScheduleError::InvalidRange(format!(
                "start {start} is after end {end}"
            )));
        }

        let mut all = Vec::new();
        let mut day = start;
        while day <= end {
            let records = self.fetcher.fetch_days(client, day, day, self.display_tz).await?;
            all.extend(records);
            day += chrono::Duration::days(1);
        }
        let records = dedup_records(all);

        let appointment_types = appointment_type_names(&records);
        let surgery_ids = surgery_location_ids(&records);
        let directory = self.directory.resolve(client).await;
        let surgery_locations = surgery_ids
            .iter()
            .map(|id| SurgeryLocation {
                id: id.clone(),
                name: resolve_location_name(&directory, id),
            })
            .collect();

        Ok(AppointmentTypesResponse {
            appointment_types,
            appointments_scanned: records.len(),
            surgery_location_ids: surgery_ids,
            surgery_locations,
        })
    }

    /// Kick off a detached refresh of the tenant's full cache window.
    /// Returns immediately; failures are logged and never reach any caller.
    /// Concurrent requests may race to schedule redundant refreshes, which is
    /// tolerated: the overwrite is idempotent.
    pub fn trigger_prewarm(&self, client: &EmrClient, window_start: NaiveDate, window_end: NaiveDate) {
        let service = self.clone();
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = service.refresh_window(&client, window_start, window_end).await {
                warn!(
                    "schedule window prewarm failed for {} ({} to {}): {}",
                    client.base_url(),
                    window_start,
                    window_end,
                    e
                );
            }
        });
    }

    async fn refresh_window(
        &self,
        client: &EmrClient,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Result<(), ScheduleError> {
        let records = self
            .fetcher
            .fetch_days(client, window_start, window_end, self.display_tz)
            .await?;
        let grid = aggregate_schedule(&records, self.display_tz);
        let entry = Arc::new(WindowEntry {
            window_start,
            window_end,
            records: Arc::new(records),
            grid: Arc::new(grid),
            cached_at: Instant::now(),
        });
        let mut windows = self.windows.write().await;
        windows.insert(client.base_url().to_string(), entry);
        info!(
            "schedule window cache warmed for {} ({} to {})",
            client.base_url(),
            window_start,
            window_end
        );
        Ok(())
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.display_tz).date_naive()
    }

    /// The rolling window: anchored to Monday of the current calendar week
    /// in the display timezone, recomputed on every call.
    fn window_bounds(&self) -> (NaiveDate, NaiveDate) {
        let today = self.today();
        let anchor = today - chrono::Duration::days(today.weekday().num_days_from_monday() as i64);
        let end = anchor + chrono::Duration::weeks(self.window_weeks as i64)
            - chrono::Duration::days(1);
        (anchor, end)
    }

    /// A fresh entry must match the current anchor window exactly; an anchor
    /// that moved since the entry was written forces a refresh even inside
    /// the TTL.
    async fn cached_window(
        &self,
        tenant: &str,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Option<Arc<WindowEntry>> {
        let windows = self.windows.read().await;
        let entry = windows.get(tenant)?;
        let fresh = entry.cached_at.elapsed() < self.window_ttl
            && entry.window_start == window_start
            && entry.window_end == window_end;
        fresh.then(|| entry.clone())
    }

    fn slice_window(
        &self,
        entry: &WindowEntry,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> (Vec<AppointmentRecord>, ScheduleGrid) {
        let records: Vec<AppointmentRecord> = entry
            .records
            .iter()
            .filter(|record| {
                let date = record.start.with_timezone(&self.display_tz).date_naive();
                start_date <= date && date <= end_date
            })
            .cloned()
            .collect();
        let lo = start_date.format("%Y-%m-%d").to_string();
        let hi = end_date.format("%Y-%m-%d").to_string();
        let schedule: ScheduleGrid = entry
            .grid
            .iter()
            .filter(|(date, _)| lo.as_str() <= date.as_str() && date.as_str() <= hi.as_str())
            .map(|(date, practitioners)| (date.clone(), practitioners.clone()))
            .collect();
        (records, schedule)
    }
}

fn resolve_location_name(directory: &DirectoryMaps, id: &str) -> String {
    directory
        .location_names
        .get(id)
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "(unknown)".to_string())
}

fn resolve_surgery_locations(
    records: &[AppointmentRecord],
    directory: &DirectoryMaps,
) -> Vec<SurgeryLocation> {
    surgery_location_ids(records)
        .into_iter()
        .map(|id| {
            let name = resolve_location_name(directory, &id);
            SurgeryLocation { id, name }
        })
        .collect()
}
