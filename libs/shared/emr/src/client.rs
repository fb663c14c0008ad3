use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Response,
};
use tracing::debug;

/// Per-practice credentials for the upstream EMR's FHIR API: an OAuth bearer
/// token plus the practice's API key.
#[derive(Debug, Clone)]
pub struct EmrCredentials {
    pub access_token: String,
    pub practice_api_key: String,
}

/// Authenticated client for one upstream tenant. The base URL doubles as the
/// tenant key for every cache keyed by practice.
#[derive(Clone)]
pub struct EmrClient {
    client: Client,
    base_url: String,
    credentials: EmrCredentials,
}

impl EmrClient {
    pub fn new(base_url: impl Into<String>, credentials: EmrCredentials) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
            credentials,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.credentials.access_token)) {
            headers.insert(AUTHORIZATION, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.credentials.practice_api_key) {
            headers.insert("x-api-key", value);
        }
        headers
    }

    /// GET one page of a resource list. Status handling is left to the
    /// caller so the fetch layer can drive its own retry policy.
    pub async fn get(
        &self,
        resource: &str,
        params: &[(&str, String)],
    ) -> Result<Response, reqwest::Error> {
        let url = format!("{}/{}", self.base_url, resource);
        debug!("GET {}", url);
        self.client
            .get(&url)
            .headers(self.headers())
            .query(params)
            .send()
            .await
    }
}
