use thiserror::Error;

/// Fatal failures of a schedule operation. Soft pagination stops (loop
/// detected, safety cap reached) are not errors: the fetch returns what it
/// collected and logs the anomaly. Directory failures degrade to empty maps
/// and never surface here.
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("upstream API error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream network error after {attempts} attempts: {source}")]
    Network {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to decode upstream response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid request range: {0}")]
    InvalidRange(String),
}
