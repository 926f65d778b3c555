//! API request and response models.

use serde::{Deserialize, Serialize};

/// Request body for POST /~context.
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    /// Context id chosen by the page.
    pub id: String,
    /// Current location of the context, in proxy form.
    pub url: String,
    #[serde(default)]
    pub focused: bool,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

/// Response body for POST /~context.
#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    /// Number of live contexts.
    pub live: usize,
}

/// Response body for DELETE /~context/{id}.
#[derive(Debug, Serialize)]
pub struct ForgetResponse {
    pub removed: bool,
}
