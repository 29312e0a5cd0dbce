use crate::error::AllocError;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Hands out fresh session ids to payloads that ask for one.
pub trait IdAllocator {
    fn allocate(&self) -> impl Future<Output = Result<i64, AllocError>> + Send;
}

#[derive(Debug, Deserialize)]
struct AssignedId {
    assigned_id: Option<i64>,
}

/// Allocator backed by the ground station web service.
#[derive(Debug, Clone)]
pub struct HttpIdAllocator {
    client: reqwest::Client,
    url: String,
}

impl HttpIdAllocator {
    pub fn new(base_url: &str) -> Result<Self, AllocError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("{}/cansat_req_id", base_url.trim_end_matches('/')),
        })
    }
}

impl IdAllocator for HttpIdAllocator {
    async fn allocate(&self) -> Result<i64, AllocError> {
        let response = self.client.post(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AllocError::Status(status));
        }
        let body: AssignedId = response.json().await?;
        body.assigned_id.ok_or(AllocError::MissingId)
    }
}

impl<A> IdAllocator for Option<A>
where
    A: IdAllocator + Sync,
{
    async fn allocate(&self) -> Result<i64, AllocError> {
        match self {
            Some(allocator) => allocator.allocate().await,
            None => Err(AllocError::Unconfigured),
        }
    }
}

/// Reply line sent back to the payload, before link encoding.
pub fn id_assignment_line(admin_key: &str, session_id: i64) -> String {
    format!("{admin_key}-ID_ASSIGN-{session_id}")
}
