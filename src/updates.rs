use chrono::{DateTime, Utc};

use crate::domain::Update;
use crate::error::KiraError;
use crate::revisions::{PassTransaction, Repository};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    pub size: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

pub struct UpdateRecorder<'a> {
    repository: &'a Repository,
}

impl<'a> UpdateRecorder<'a> {
    pub fn new(repository: &'a Repository) -> Self {
        Self { repository }
    }

    pub fn record(
        &self,
        pass: PassTransaction<'_>,
        timestamp: DateTime<Utc>,
        resource: ResourceInfo,
    ) -> Result<Option<Update>, KiraError> {
        if pass.is_empty() {
            tracing::debug!(dataset = %pass.dataset(), "pass produced no revisions");
            return Ok(None);
        }
        let dataset = pass.dataset();
        let count = pass.len();
        let update = self.repository.commit_pass(pass, timestamp, resource)?;
        if let Some(update) = &update {
            tracing::info!(%dataset, update = %update.id, revisions = count, "recorded update");
        }
        Ok(update)
    }
}
