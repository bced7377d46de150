//! Face templates and 1:N matching.
//!
//! Templates come from an external descriptor-extraction model and are
//! consumed as opaque fixed-length vectors. Matching is a pure distance
//! computation plus a strict `distance < threshold` acceptance rule.

pub mod matcher;
pub mod template;

pub use matcher::{compare, MatchEngine, MatchOutcome, DEFAULT_ACCEPT_THRESHOLD};
pub use template::{BiometricTemplate, DEFAULT_TEMPLATE_LENGTH, TEMPLATE_FORMAT_VERSION};
