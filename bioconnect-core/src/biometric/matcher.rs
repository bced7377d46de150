//! 1:N identification by Euclidean distance against enrolled templates.

use super::template::{BiometricTemplate, DEFAULT_TEMPLATE_LENGTH};
use crate::{BioConnectError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Distance below which two templates are taken to be the same person.
pub const DEFAULT_ACCEPT_THRESHOLD: f32 = 0.6;

/// Result of an identification attempt. `NoMatch` is a normal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchOutcome {
    Match { local_id: String, distance: f32 },
    NoMatch,
}

impl MatchOutcome {
    pub fn local_id(&self) -> Option<&str> {
        match self {
            Self::Match { local_id, .. } => Some(local_id),
            Self::NoMatch => None,
        }
    }
}

/// Euclidean distance between two templates.
///
/// Symmetric, and zero for identical templates. Fails with `InvalidTemplate`
/// when the lengths differ.
pub fn compare(a: &BiometricTemplate, b: &BiometricTemplate) -> Result<f32> {
    if a.len() != b.len() {
        return Err(BioConnectError::InvalidTemplate(format!(
            "cannot compare templates of length {} and {}",
            a.len(),
            b.len()
        )));
    }

    // Accumulate in f64 to keep long sums stable.
    let sum: f64 = a
        .as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum();

    Ok(sum.sqrt() as f32)
}

/// Threshold-based identification policy.
///
/// The threshold is a tunable policy value: raising it increases the
/// false-accept rate, lowering it increases the false-reject rate.
#[derive(Debug, Clone, Copy)]
pub struct MatchEngine {
    threshold: f32,
    template_length: usize,
}

impl Default for MatchEngine {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ACCEPT_THRESHOLD,
            template_length: DEFAULT_TEMPLATE_LENGTH,
        }
    }
}

impl MatchEngine {
    pub fn new(threshold: f32, template_length: usize) -> Result<Self> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(BioConnectError::InvalidInput(format!(
                "accept threshold must be a positive number, got {}",
                threshold
            )));
        }
        if template_length == 0 {
            return Err(BioConnectError::InvalidInput(
                "template length must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            threshold,
            template_length,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn template_length(&self) -> usize {
        self.template_length
    }

    /// Strict acceptance: a distance equal to the threshold is rejected.
    pub fn accepts(&self, distance: f32) -> bool {
        distance < self.threshold
    }

    /// Check that a template has the length this engine was configured for.
    pub fn validate(&self, template: &BiometricTemplate) -> Result<()> {
        if template.len() != self.template_length {
            return Err(BioConnectError::InvalidTemplate(format!(
                "expected {} components, got {}",
                self.template_length,
                template.len()
            )));
        }
        Ok(())
    }

    /// Find the closest enrolled candidate and accept it if it is within
    /// the threshold.
    ///
    /// An empty candidate set is always `NoMatch`. Equal minimal distances
    /// resolve to the lexicographically smallest `local_id`. Candidates whose
    /// template length differs from the configured one are skipped.
    pub fn identify<'a, I>(&self, live: &BiometricTemplate, candidates: I) -> Result<MatchOutcome>
    where
        I: IntoIterator<Item = (&'a str, &'a BiometricTemplate)>,
    {
        let mut candidates = candidates.into_iter().peekable();
        if candidates.peek().is_none() {
            return Ok(MatchOutcome::NoMatch);
        }
        self.validate(live)?;

        let mut best: Option<(&str, f32)> = None;
        for (local_id, template) in candidates {
            if template.len() != self.template_length {
                warn!(
                    "Skipping candidate {} with template length {}",
                    local_id,
                    template.len()
                );
                continue;
            }
            let distance = compare(live, template)?;
            best = match best {
                Some((best_id, best_distance))
                    if best_distance < distance
                        || (best_distance == distance && best_id <= local_id) =>
                {
                    Some((best_id, best_distance))
                }
                _ => Some((local_id, distance)),
            };
        }

        match best {
            Some((local_id, distance)) if self.accepts(distance) => {
                debug!("Identified {} at distance {:.4}", local_id, distance);
                Ok(MatchOutcome::Match {
                    local_id: local_id.to_string(),
                    distance,
                })
            }
            Some((local_id, distance)) => {
                debug!(
                    "Closest candidate {} at distance {:.4} is outside threshold {}",
                    local_id, distance, self.threshold
                );
                Ok(MatchOutcome::NoMatch)
            }
            None => Ok(MatchOutcome::NoMatch),
        }
    }

    /// 1:1 verification of a live template against one enrolled template.
    pub fn verify(&self, live: &BiometricTemplate, enrolled: &BiometricTemplate) -> Result<bool> {
        self.validate(live)?;
        Ok(self.accepts(compare(live, enrolled)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(values: Vec<f32>) -> BiometricTemplate {
        BiometricTemplate::new(values).unwrap()
    }

    /// A 128-d template that is zero except for the first component.
    fn offset(first: f32) -> BiometricTemplate {
        let mut values = vec![0.0; DEFAULT_TEMPLATE_LENGTH];
        values[0] = first;
        template(values)
    }

    fn sample(seed: f32) -> BiometricTemplate {
        template(
            (0..DEFAULT_TEMPLATE_LENGTH)
                .map(|i| ((i as f32 + seed) * 0.731).cos() * 0.1)
                .collect(),
        )
    }

    #[test]
    fn distance_to_self_is_zero() {
        for seed in [0.0, 1.5, 42.0] {
            let t = sample(seed);
            assert_eq!(compare(&t, &t).unwrap(), 0.0);
        }
    }

    #[test]
    fn distance_is_symmetric() {
        let pairs = [(0.0, 1.0), (3.3, 9.1), (17.0, 0.5)];
        for (a, b) in pairs {
            let (ta, tb) = (sample(a), sample(b));
            assert_eq!(
                compare(&ta, &tb).unwrap().to_bits(),
                compare(&tb, &ta).unwrap().to_bits()
            );
        }
    }

    #[test]
    fn distance_is_euclidean() {
        let a = template(vec![0.0, 0.0]);
        let b = template(vec![3.0, 4.0]);
        assert_eq!(compare(&a, &b).unwrap(), 5.0);
    }

    #[test]
    fn compare_rejects_length_mismatch() {
        let a = template(vec![0.0; 3]);
        let b = template(vec![0.0; 4]);
        assert!(matches!(
            compare(&a, &b),
            Err(BioConnectError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn empty_candidate_set_is_no_match() {
        let engine = MatchEngine::default();
        let live = sample(1.0);
        assert_eq!(
            engine.identify(&live, std::iter::empty()).unwrap(),
            MatchOutcome::NoMatch
        );

        // Even a malformed live template yields NoMatch without candidates.
        let short = template(vec![0.0; 3]);
        assert_eq!(
            engine.identify(&short, std::iter::empty()).unwrap(),
            MatchOutcome::NoMatch
        );
    }

    #[test]
    fn malformed_live_template_is_invalid() {
        let engine = MatchEngine::default();
        let enrolled = sample(1.0);
        let short = template(vec![0.0; 3]);

        let err = engine
            .identify(&short, [("a", &enrolled)])
            .unwrap_err();
        assert!(matches!(err, BioConnectError::InvalidTemplate(_)));
    }

    #[test]
    fn threshold_boundary_is_strict() {
        let engine = MatchEngine::default();
        let live = offset(0.0);

        let near = offset(0.59);
        let exact = offset(0.6);
        let far = offset(0.61);

        assert_eq!(
            engine.identify(&live, [("near", &near)]).unwrap(),
            MatchOutcome::Match {
                local_id: "near".to_string(),
                distance: 0.59
            }
        );
        assert_eq!(
            engine.identify(&live, [("exact", &exact)]).unwrap(),
            MatchOutcome::NoMatch
        );
        assert_eq!(
            engine.identify(&live, [("far", &far)]).unwrap(),
            MatchOutcome::NoMatch
        );
    }

    #[test]
    fn closest_candidate_wins() {
        let engine = MatchEngine::default();
        let live = offset(0.0);
        let close = offset(0.1);
        let closer = offset(0.05);
        let far = offset(0.5);

        let outcome = engine
            .identify(&live, [("c", &close), ("b", &closer), ("a", &far)])
            .unwrap();
        assert_eq!(outcome.local_id(), Some("b"));
    }

    #[test]
    fn ties_resolve_to_smallest_local_id() {
        let engine = MatchEngine::default();
        let live = offset(0.0);
        let left = offset(0.2);
        let right = offset(-0.2);

        for _ in 0..10 {
            let forward = engine
                .identify(&live, [("m-2", &left), ("m-1", &right), ("z", &left)])
                .unwrap();
            let reverse = engine
                .identify(&live, [("z", &left), ("m-1", &right), ("m-2", &left)])
                .unwrap();
            assert_eq!(forward.local_id(), Some("m-1"));
            assert_eq!(reverse.local_id(), Some("m-1"));
        }
    }

    #[test]
    fn custom_threshold_is_honored() {
        let strict = MatchEngine::new(0.3, DEFAULT_TEMPLATE_LENGTH).unwrap();
        let live = offset(0.0);
        let candidate = offset(0.4);

        assert_eq!(
            strict.identify(&live, [("a", &candidate)]).unwrap(),
            MatchOutcome::NoMatch
        );
        assert!(MatchEngine::default()
            .identify(&live, [("a", &candidate)])
            .unwrap()
            .local_id()
            .is_some());
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        assert!(MatchEngine::new(0.0, 128).is_err());
        assert!(MatchEngine::new(f32::NAN, 128).is_err());
        assert!(MatchEngine::new(0.6, 0).is_err());
    }

    #[test]
    fn verify_uses_the_same_threshold() {
        let engine = MatchEngine::default();
        let live = offset(0.0);
        assert!(engine.verify(&live, &offset(0.3)).unwrap());
        assert!(!engine.verify(&live, &offset(0.6)).unwrap());
    }
}
