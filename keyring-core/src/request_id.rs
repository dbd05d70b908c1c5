//! Request ID generation

use uuid::Uuid;

/// Response header carrying the request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identifier attached to a single inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId {
    pub id: String,
}

impl RequestId {
    /// Generate a new request ID
    pub fn new() -> Self {
        let id = Uuid::new_v4().simple().to_string().to_uppercase();
        Self { id }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}
