use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use schedule_cell::DirectoryResolver;
use shared_emr::{EmrClient, EmrCredentials};

fn test_client(server: &MockServer) -> EmrClient {
    EmrClient::new(
        server.uri(),
        EmrCredentials {
            access_token: "test-token".to_string(),
            practice_api_key: "test-key".to_string(),
        },
    )
}

fn resolver() -> DirectoryResolver {
    DirectoryResolver::new(Arc::new(Semaphore::new(3)), Duration::from_secs(3600))
}

fn page_number(request: &Request) -> u32 {
    request
        .url
        .query_pairs()
        .find(|(key, _)| key == "page")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(1)
}

fn practitioner_bundle(id: &str, next_page: u32) -> serde_json::Value {
    json!({
        "resourceType": "Bundle",
        "entry": [{"resource": {
            "resourceType": "Practitioner",
            "id": id,
            "name": [{"text": "Jane Doe, MD"}]
        }}],
        "link": [{
            "relation": "next",
            "url": format!("https://emr.example.com/Practitioner?_count=50&page={next_page}")
        }]
    })
}

async fn mount_empty_locations(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/Location"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [],
            "link": []
        })))
        .mount(server)
        .await;
}

async fn practitioner_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/Practitioner")
        .count()
}

/// Broken cursor that re-serves the same practitioner under ever-increasing
/// page numbers.
struct SamePractitionerForever;

impl Respond for SamePractitionerForever {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let page = page_number(request);
        ResponseTemplate::new(200).set_body_json(practitioner_bundle("123", page + 1))
    }
}

/// Broken cursor that never repeats content, so only the safety cap can
/// stop it.
struct FreshPractitionerForever;

impl Respond for FreshPractitionerForever {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let page = page_number(request);
        ResponseTemplate::new(200)
            .set_body_json(practitioner_bundle(&format!("{page}"), page + 1))
    }
}

#[tokio::test]
async fn directory_pagination_stops_when_a_page_re_serves_known_content() {
    let server = MockServer::start().await;
    mount_empty_locations(&server).await;
    Mock::given(method("GET"))
        .and(path("/Practitioner"))
        .respond_with(SamePractitionerForever)
        .mount(&server)
        .await;

    let maps = resolver().resolve(&test_client(&server)).await;

    // Page 2 carried nothing new, so the walk stopped there.
    assert_eq!(practitioner_requests(&server).await, 2);
    assert_eq!(
        maps.practitioner_names.get("123").map(String::as_str),
        Some("Jane Doe, MD")
    );
}

#[tokio::test]
async fn directory_pagination_honors_the_page_safety_cap() {
    let server = MockServer::start().await;
    mount_empty_locations(&server).await;
    Mock::given(method("GET"))
        .and(path("/Practitioner"))
        .respond_with(FreshPractitionerForever)
        .mount(&server)
        .await;

    let maps = resolver()
        .with_page_cap(3)
        .resolve(&test_client(&server))
        .await;

    // The soft stop keeps everything collected up to the cap.
    assert_eq!(practitioner_requests(&server).await, 3);
    assert_eq!(maps.practitioner_names.len(), 3);
}
