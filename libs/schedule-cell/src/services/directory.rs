use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

use shared_emr::EmrClient;

use crate::models::{Bundle, LocationResource, PageCursor, PractitionerResource};
use crate::services::fetch::{MAX_SAFETY_PAGES, PAGE_SIZE};

/// The upstream emits "ref|<id>" for practitioners in some contexts and the
/// bare id in others; map keys always use the bare form so appointment
/// references resolve against the practitioner list.
pub fn canonical_practitioner_id(id: &str) -> String {
    let trimmed = id.trim();
    trimmed.strip_prefix("ref|").unwrap_or(trimmed).to_string()
}

/// Practitioner and location id -> display maps for one tenant.
#[derive(Debug, Clone, Default)]
pub struct DirectoryMaps {
    pub practitioner_names: HashMap<String, String>,
    pub location_names: HashMap<String, String>,
    /// Kept for the response contract; the upstream does not publish these
    /// yet, so they stay empty.
    pub practitioner_roles: HashMap<String, String>,
    pub practitioner_types: HashMap<String, String>,
}

struct DirectoryEntry {
    maps: Arc<DirectoryMaps>,
    cached_at: Instant,
}

/// Best-effort directory resolver with a per-tenant TTL cache. A failed
/// directory fetch degrades to empty maps: the schedule grid stays usable
/// with bare ids, names fill in on a later refresh.
pub struct DirectoryResolver {
    limiter: Arc<Semaphore>,
    ttl: Duration,
    max_pages: u32,
    cache: RwLock<HashMap<String, DirectoryEntry>>,
}

impl DirectoryResolver {
    pub fn new(limiter: Arc<Semaphore>, ttl: Duration) -> Self {
        Self {
            limiter,
            ttl,
            max_pages: MAX_SAFETY_PAGES,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Override the pagination safety cap. Tests use this to reach the cap
    /// without a thousand mock pages.
    pub fn with_page_cap(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Resolve the directory maps for the client's tenant. Never fails; a
    /// cache hit makes no network call at all.
    pub async fn resolve(&self, client: &EmrClient) -> Arc<DirectoryMaps> {
        let tenant = client.base_url().to_string();
        if let Some(maps) = self.cached(&tenant).await {
            debug!("directory cache hit for {}", tenant);
            return maps;
        }

        let (practitioner_names, location_names) =
            tokio::join!(self.fetch_practitioners(client), self.fetch_locations(client));
        let maps = Arc::new(DirectoryMaps {
            practitioner_names,
            location_names,
            practitioner_roles: HashMap::new(),
            practitioner_types: HashMap::new(),
        });

        // Whole-entry replacement; concurrent readers keep their old Arc.
        let mut cache = self.cache.write().await;
        cache.insert(
            tenant,
            DirectoryEntry {
                maps: maps.clone(),
                cached_at: Instant::now(),
            },
        );
        maps
    }

    async fn cached(&self, tenant: &str) -> Option<Arc<DirectoryMaps>> {
        let cache = self.cache.read().await;
        let entry = cache.get(tenant)?;
        (entry.cached_at.elapsed() < self.ttl).then(|| entry.maps.clone())
    }

    async fn fetch_practitioners(&self, client: &EmrClient) -> HashMap<String, String> {
        let _permit = self.limiter.acquire().await.unwrap();
        let mut names = HashMap::new();
        let mut cursor: Option<PageCursor> = None;
        let mut seen_pages: HashSet<PageCursor> = HashSet::new();
        let mut page_count = 0u32;
        loop {
            page_count += 1;
            if page_count > self.max_pages {
                warn!(
                    "practitioner pagination hit the {} page safety cap for {}; stopping",
                    self.max_pages,
                    client.base_url()
                );
                break;
            }
            let bundle: Bundle<PractitionerResource> =
                match self.get_directory_page(client, "Practitioner", cursor).await {
                    Some(bundle) => bundle,
                    None => return names,
                };
            let next = bundle.next_page();
            let mut usable = 0usize;
            let mut new_ids = 0usize;
            for resource in bundle.resources() {
                if resource.resource_type.as_deref() != Some("Practitioner") {
                    continue;
                }
                let Some(id) = resource.id.as_deref().filter(|id| !id.is_empty()) else {
                    continue;
                };
                usable += 1;
                let display = practitioner_display_name(&resource);
                if names.insert(canonical_practitioner_id(id), display).is_none() {
                    new_ids += 1;
                }
            }
            // A page of nothing but already-known ids means the next cursor
            // is re-serving old content under new page numbers.
            if usable > 0 && new_ids == 0 {
                warn!(
                    "practitioner page re-served known content for {}; stopping",
                    client.base_url()
                );
                break;
            }
            match next {
                Some(page) if seen_pages.insert(page) => cursor = Some(page),
                Some(page) => {
                    warn!(
                        "practitioner page {} already visited for {}; stopping",
                        page.0,
                        client.base_url()
                    );
                    break;
                }
                None => break,
            }
        }
        names
    }

    async fn fetch_locations(&self, client: &EmrClient) -> HashMap<String, String> {
        let _permit = self.limiter.acquire().await.unwrap();
        let mut names = HashMap::new();
        let mut cursor: Option<PageCursor> = None;
        let mut seen_pages: HashSet<PageCursor> = HashSet::new();
        let mut page_count = 0u32;
        loop {
            page_count += 1;
            if page_count > self.max_pages {
                warn!(
                    "location pagination hit the {} page safety cap for {}; stopping",
                    self.max_pages,
                    client.base_url()
                );
                break;
            }
            let bundle: Bundle<LocationResource> =
                match self.get_directory_page(client, "Location", cursor).await {
                    Some(bundle) => bundle,
                    None => return names,
                };
            let next = bundle.next_page();
            let mut usable = 0usize;
            let mut new_ids = 0usize;
            for resource in bundle.resources() {
                if resource.resource_type.as_deref() != Some("Location") {
                    continue;
                }
                let Some(id) = resource.id.as_deref().filter(|id| !id.is_empty()) else {
                    continue;
                };
                usable += 1;
                let name = resource.name.as_deref().unwrap_or("").trim().to_string();
                if names.insert(id.to_string(), name).is_none() {
                    new_ids += 1;
                }
            }
            if usable > 0 && new_ids == 0 {
                warn!(
                    "location page re-served known content for {}; stopping",
                    client.base_url()
                );
                break;
            }
            match next {
                Some(page) if seen_pages.insert(page) => cursor = Some(page),
                Some(page) => {
                    warn!(
                        "location page {} already visited for {}; stopping",
                        page.0,
                        client.base_url()
                    );
                    break;
                }
                None => break,
            }
        }
        names
    }

    /// One directory list page. Any failure (transport, non-200, bad body)
    /// returns None so the caller degrades to whatever it has collected.
    async fn get_directory_page<T: DeserializeOwned>(
        &self,
        client: &EmrClient,
        resource: &str,
        cursor: Option<PageCursor>,
    ) -> Option<Bundle<T>> {
        let mut params = vec![("_count", PAGE_SIZE.to_string())];
        if let Some(page) = cursor {
            params.push(("page", page.0.to_string()));
        }
        let response = match client.get(resource, &params).await {
            Ok(response) => response,
            Err(e) => {
                warn!("GET /{} failed: {}; skipping directory names", resource, e);
                return None;
            }
        };
        let status = response.status();
        if !status.is_success() {
            warn!("GET /{} returned {}; skipping directory names", resource, status);
            return None;
        }
        match response.json::<Bundle<T>>().await {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!(
                    "GET /{} returned an unreadable bundle: {}; skipping directory names",
                    resource, e
                );
                None
            }
        }
    }
}

/// Display name from a Practitioner resource: prefer the free-text name,
/// otherwise join given names and family with a space. Never null, possibly
/// empty.
fn practitioner_display_name(resource: &PractitionerResource) -> String {
    let Some(name) = resource.name.first() else {
        return String::new();
    };
    if let Some(text) = name.text.as_deref().map(str::trim).filter(|text| !text.is_empty()) {
        return text.to_string();
    }
    let given = name.given.join(" ");
    let family = name.family.as_deref().unwrap_or("");
    format!("{} {}", given.trim(), family.trim()).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_id_strips_the_ref_prefix() {
        assert_eq!(canonical_practitioner_id("ref|21974"), "21974");
        assert_eq!(canonical_practitioner_id("21974"), "21974");
        assert_eq!(canonical_practitioner_id("  ref|7 "), "7");
        assert_eq!(canonical_practitioner_id(""), "");
    }

    fn practitioner(value: serde_json::Value) -> PractitionerResource {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn display_name_prefers_free_text() {
        let resource = practitioner(json!({
            "resourceType": "Practitioner",
            "id": "1",
            "name": [{"text": " Jane Doe, MD ", "given": ["Janet"], "family": "Doe"}]
        }));
        assert_eq!(practitioner_display_name(&resource), "Jane Doe, MD");
    }

    #[test]
    fn display_name_joins_given_and_family() {
        let resource = practitioner(json!({
            "resourceType": "Practitioner",
            "id": "1",
            "name": [{"given": ["Jane", "Q"], "family": "Doe"}]
        }));
        assert_eq!(practitioner_display_name(&resource), "Jane Q Doe");
    }

    #[test]
    fn display_name_is_empty_not_null_when_nothing_is_usable() {
        let resource = practitioner(json!({
            "resourceType": "Practitioner",
            "id": "1",
            "name": []
        }));
        assert_eq!(practitioner_display_name(&resource), "");

        let resource = practitioner(json!({
            "resourceType": "Practitioner",
            "id": "1",
            "name": [{"family": "Solo"}]
        }));
        assert_eq!(practitioner_display_name(&resource), "Solo");
    }
}
