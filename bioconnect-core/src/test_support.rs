//! Fixtures shared by unit tests.

use crate::biometric::{BiometricTemplate, DEFAULT_TEMPLATE_LENGTH};
use crate::database::{Identity, Role};
use chrono::Utc;

/// A deterministic 128-d template; different seeds are far apart.
pub fn template(seed: f32) -> BiometricTemplate {
    BiometricTemplate::new(
        (0..DEFAULT_TEMPLATE_LENGTH)
            .map(|i| ((i as f32 + 1.0) * seed * 0.37).sin() * 0.25)
            .collect(),
    )
    .unwrap()
}

/// `base` shifted by `delta` on its first component.
pub fn nudged(base: &BiometricTemplate, delta: f32) -> BiometricTemplate {
    let mut values = base.as_slice().to_vec();
    values[0] += delta;
    BiometricTemplate::new(values).unwrap()
}

pub fn identity(name: &str, seed: f32) -> Identity {
    Identity::new(name, Role::Worker, template(seed), Utc::now())
}
