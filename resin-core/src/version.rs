use async_trait::async_trait;

use crate::id::Id;
use crate::sync::SendReport;

/// Default `source_application` for versions created by this crate.
pub const DEFAULT_SOURCE_APPLICATION: &str = "resin";

/// Request to record a new version pointing at a sent root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVersion {
    pub object_id: Id,
    pub message: Option<String>,
    pub parent_version_id: Option<String>,
    pub source_application: String,
    /// Records below the root.
    pub total_children_count: usize,
}

impl CreateVersion {
    pub fn new(object_id: Id) -> Self {
        CreateVersion {
            object_id,
            message: None,
            parent_version_id: None,
            source_application: DEFAULT_SOURCE_APPLICATION.to_string(),
            total_children_count: 0,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_parent(mut self, parent_version_id: impl Into<String>) -> Self {
        self.parent_version_id = Some(parent_version_id.into());
        self
    }

    pub fn with_source_application(mut self, source_application: impl Into<String>) -> Self {
        self.source_application = source_application.into();
        self
    }
}

/// Error type for version creation.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("send did not complete on every transport: {0}")]
    IncompleteSend(SendReport),
    #[error("version service failed: {0}")]
    Service(String),
}

/// The service that records versions. Returns the new version id.
#[async_trait]
pub trait VersionCreator: Send + Sync {
    async fn create_version(&self, request: CreateVersion) -> Result<String, VersionError>;
}

/// Creates a version for a finished send.
///
/// Refuses reports where any transport did not complete, so that a version
/// never points at a root some target lacks.
#[tracing::instrument(skip_all, fields(root = %report.root_id))]
pub async fn create_version_after_send(
    creator: &dyn VersionCreator,
    report: &SendReport,
    request: CreateVersion,
) -> Result<String, VersionError> {
    if !report.is_complete() {
        return Err(VersionError::IncompleteSend(report.clone()));
    }
    let request = CreateVersion {
        object_id: report.root_id,
        total_children_count: report.record_count.saturating_sub(1),
        ..request
    };
    let version_id = creator.create_version(request).await?;
    tracing::info!(version = %version_id, "created version");
    Ok(version_id)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::sync::TransportOutcome;
    use crate::transport::TransportError;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<CreateVersion>>,
    }

    #[async_trait]
    impl VersionCreator for Recorder {
        async fn create_version(&self, request: CreateVersion) -> Result<String, VersionError> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            Ok(format!("v{}", requests.len()))
        }
    }

    fn report(outcome: TransportOutcome) -> SendReport {
        SendReport {
            root_id: Id::from_bytes([1; 32]),
            record_count: 4,
            outcomes: vec![("remote".to_string(), outcome)],
            warnings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn creates_version_for_complete_send() {
        let recorder = Recorder::default();
        let report = report(TransportOutcome::Completed {
            uploaded: 4,
            skipped: 0,
        });
        let request = CreateVersion::new(Id::from_bytes([0; 32]))
            .with_message("first")
            .with_source_application("test");

        let version = create_version_after_send(&recorder, &report, request)
            .await
            .unwrap();
        assert_eq!(version, "v1");

        let requests = recorder.requests.lock().unwrap();
        assert_eq!(requests[0].object_id, report.root_id);
        assert_eq!(requests[0].total_children_count, 3);
        assert_eq!(requests[0].message.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn refuses_incomplete_send() {
        let recorder = Recorder::default();
        let report = report(TransportOutcome::Failed(TransportError::Closed {
            transport: "remote".to_string(),
        }));
        let err = create_version_after_send(&recorder, &report, CreateVersion::new(report.root_id))
            .await
            .unwrap_err();
        assert!(matches!(err, VersionError::IncompleteSend(_)));
        assert!(recorder.requests.lock().unwrap().is_empty());
    }
}
