/// Feature resolution and risk scoring.
///
/// Everything between "a location" and "a risk score" lives here. Tier
/// classification and alerting are downstream, in `alert`.
///
/// Submodules:
/// - `resolver`: gathers elevation, water distance and rainfall for a
///   location from the data collaborators, with bounded lookups.
/// - `scoring`: turns a feature vector into a normalized score and
///   confidence.

pub mod resolver;
pub mod scoring;
