//! File-backed capture: a "camera" that reads a face descriptor file
//! produced by the extraction model, as a JSON array of floats.

use bioconnect_core::{BiometricTemplate, Camera, CaptureError, Extractor, ImageHandle};
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, warn};

pub struct DescriptorFile {
    path: PathBuf,
}

impl DescriptorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Camera for DescriptorFile {
    fn capture(&self) -> Result<ImageHandle, CaptureError> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(ImageHandle::new(self.path.display().to_string(), data)),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(CaptureError::PermissionDenied),
            Err(e) => {
                warn!("Cannot read {}: {}", self.path.display(), e);
                Err(CaptureError::NoCamera)
            }
        }
    }
}

/// Parses descriptor JSON. Anything unparseable counts as "no face".
pub struct DescriptorExtractor;

impl Extractor for DescriptorExtractor {
    fn extract(&self, image: &ImageHandle) -> Option<BiometricTemplate> {
        let values: Vec<f32> = match serde_json::from_slice(&image.data) {
            Ok(values) => values,
            Err(e) => {
                debug!("No descriptor in {}: {}", image.source, e);
                return None;
            }
        };
        BiometricTemplate::new(values)
            .map_err(|e| debug!("Unusable descriptor in {}: {}", image.source, e))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_descriptor_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[0.1, -0.2, 0.3]").unwrap();

        let image = DescriptorFile::new(file.path()).capture().unwrap();
        let template = DescriptorExtractor.extract(&image).unwrap();
        assert_eq!(template.as_slice(), &[0.1, -0.2, 0.3]);
    }

    #[test]
    fn missing_file_is_no_camera() {
        let dir = tempfile::tempdir().unwrap();
        let camera = DescriptorFile::new(dir.path().join("missing.json"));
        assert_eq!(camera.capture().unwrap_err(), CaptureError::NoCamera);
    }

    #[test]
    fn garbage_is_no_face() {
        let image = ImageHandle::new("inline", b"not json".to_vec());
        assert!(DescriptorExtractor.extract(&image).is_none());

        let empty = ImageHandle::new("inline", b"[]".to_vec());
        assert!(DescriptorExtractor.extract(&empty).is_none());
    }
}
