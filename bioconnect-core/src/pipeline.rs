//! Capture → extract → match/enroll glue around the local store.

use crate::biometric::{BiometricTemplate, MatchOutcome};
use crate::database::{Identity, Role};
use crate::store::LocalStore;
use crate::sync::{SyncHandle, SyncQueueItem};
use crate::BioConnectError;
use thiserror::Error;
use tracing::{debug, info};

/// Opaque captured image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHandle {
    pub source: String,
    pub data: Vec<u8>,
}

impl ImageHandle {
    pub fn new(source: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            data,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("No camera available")]
    NoCamera,

    #[error("Camera permission denied")]
    PermissionDenied,
}

/// Source of still images.
pub trait Camera: Send + Sync {
    fn capture(&self) -> std::result::Result<ImageHandle, CaptureError>;
}

/// Face descriptor extraction. `None` means no face was detected.
pub trait Extractor: Send + Sync {
    fn extract(&self, image: &ImageHandle) -> Option<BiometricTemplate>;
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("No face detected")]
    NoFaceDetected,

    #[error(transparent)]
    Core(#[from] BioConnectError),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Runs capture and extraction, then hands the template to the store.
///
/// When a [`SyncHandle`] is attached, every queued mutation is followed by
/// a sync request so replication starts as soon as the device is online.
pub struct BiometricPipeline<C: Camera, E: Extractor> {
    camera: C,
    extractor: E,
    store: LocalStore,
    sync: Option<SyncHandle>,
}

impl<C: Camera, E: Extractor> BiometricPipeline<C, E> {
    pub fn new(camera: C, extractor: E, store: LocalStore) -> Self {
        Self {
            camera,
            extractor,
            store,
            sync: None,
        }
    }

    pub fn with_sync(mut self, sync: SyncHandle) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn capture_template(&self) -> PipelineResult<BiometricTemplate> {
        let image = self.camera.capture()?;
        debug!("Captured image from {}", image.source);
        self.extractor
            .extract(&image)
            .ok_or(PipelineError::NoFaceDetected)
    }

    /// Capture a face and register a new person with it.
    pub fn register(
        &self,
        display_name: &str,
        role: Role,
    ) -> PipelineResult<(Identity, SyncQueueItem)> {
        let template = self.capture_template()?;
        let registered = self.store.register(display_name, role, template)?;
        self.request_sync();
        Ok(registered)
    }

    pub fn identify(&self) -> PipelineResult<MatchOutcome> {
        let template = self.capture_template()?;
        Ok(self.store.identify(&template)?)
    }

    pub fn verify(&self, local_id: &str) -> PipelineResult<bool> {
        let template = self.capture_template()?;
        Ok(self.store.verify(local_id, &template)?)
    }

    /// Identify the person in front of the camera and start their session.
    pub fn login(&self) -> PipelineResult<Option<Identity>> {
        match self.identify()? {
            MatchOutcome::Match { local_id, distance } => {
                let identity = self.store.set_current(&local_id)?;
                info!("Session started for {} (distance {:.4})", local_id, distance);
                Ok(Some(identity))
            }
            MatchOutcome::NoMatch => Ok(None),
        }
    }

    pub fn reenroll(&self, local_id: &str) -> PipelineResult<Identity> {
        let template = self.capture_template()?;
        let (identity, _) = self.store.reenroll(local_id, template)?;
        self.request_sync();
        Ok(identity)
    }

    fn request_sync(&self) {
        if let Some(sync) = &self.sync {
            sync.force_sync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biometric::MatchEngine;
    use crate::database::{shared, Database};
    use crate::test_support::{nudged, template};
    use std::sync::Mutex;

    struct FakeCamera {
        result: std::result::Result<(), CaptureError>,
    }

    impl Camera for FakeCamera {
        fn capture(&self) -> std::result::Result<ImageHandle, CaptureError> {
            self.result.clone()?;
            Ok(ImageHandle::new("fake", Vec::new()))
        }
    }

    /// Returns whatever face was last placed in front of it.
    #[derive(Default)]
    struct FakeExtractor {
        face: Mutex<Option<BiometricTemplate>>,
    }

    impl Extractor for &FakeExtractor {
        fn extract(&self, _image: &ImageHandle) -> Option<BiometricTemplate> {
            self.face.lock().unwrap().clone()
        }
    }

    impl FakeExtractor {
        fn show(&self, face: Option<BiometricTemplate>) {
            *self.face.lock().unwrap() = face;
        }
    }

    fn pipeline(extractor: &FakeExtractor) -> BiometricPipeline<FakeCamera, &FakeExtractor> {
        let store = LocalStore::new(shared(Database::in_memory().unwrap()), MatchEngine::default());
        BiometricPipeline::new(FakeCamera { result: Ok(()) }, extractor, store)
    }

    #[test]
    fn register_then_login() {
        let extractor = FakeExtractor::default();
        let pipeline = pipeline(&extractor);

        extractor.show(Some(template(1.0)));
        let (ana, item) = pipeline.register("Ana", Role::Supervisor).unwrap();
        assert_eq!(item.payload.local_id, ana.local_id);

        extractor.show(Some(nudged(&template(1.0), 0.1)));
        let logged_in = pipeline.login().unwrap().unwrap();
        assert_eq!(logged_in.local_id, ana.local_id);
        assert!(pipeline.store().is_supervisor().unwrap());
        assert!(pipeline.verify(&ana.local_id).unwrap());
    }

    #[test]
    fn unknown_face_does_not_log_in() {
        let extractor = FakeExtractor::default();
        let pipeline = pipeline(&extractor);

        extractor.show(Some(template(1.0)));
        pipeline.register("Ana", Role::Worker).unwrap();

        extractor.show(Some(template(5.0)));
        assert!(pipeline.login().unwrap().is_none());
        assert!(pipeline.store().current().unwrap().is_none());
    }

    #[test]
    fn no_face_is_reported() {
        let extractor = FakeExtractor::default();
        let pipeline = pipeline(&extractor);

        assert!(matches!(
            pipeline.register("Ana", Role::Worker),
            Err(PipelineError::NoFaceDetected)
        ));
        assert!(pipeline.store().list_all().unwrap().is_empty());
    }

    #[test]
    fn camera_failures_propagate() {
        let extractor = FakeExtractor::default();
        let store = LocalStore::new(shared(Database::in_memory().unwrap()), MatchEngine::default());
        let pipeline = BiometricPipeline::new(
            FakeCamera {
                result: Err(CaptureError::PermissionDenied),
            },
            &extractor,
            store,
        );

        assert!(matches!(
            pipeline.identify(),
            Err(PipelineError::Capture(CaptureError::PermissionDenied))
        ));
    }

    #[test]
    fn duplicate_registration_surfaces_core_error() {
        let extractor = FakeExtractor::default();
        let pipeline = pipeline(&extractor);

        extractor.show(Some(template(1.0)));
        pipeline.register("Ana", Role::Worker).unwrap();
        match pipeline.register("Ana again", Role::Worker) {
            Err(PipelineError::Core(e)) => {
                assert_eq!(e.kind(), crate::sync::ErrorKind::DuplicateTemplate)
            }
            other => panic!("expected duplicate, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn reenroll_keeps_identity() {
        let extractor = FakeExtractor::default();
        let pipeline = pipeline(&extractor);

        extractor.show(Some(template(1.0)));
        let (ana, _) = pipeline.register("Ana", Role::Worker).unwrap();

        let fresh = nudged(&template(1.0), 0.2);
        extractor.show(Some(fresh.clone()));
        let replaced = pipeline.reenroll(&ana.local_id).unwrap();
        assert_eq!(replaced.local_id, ana.local_id);
        assert_eq!(replaced.template, fresh);
    }
}
