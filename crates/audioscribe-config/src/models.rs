//! Static per-model tables: baseline memory requirements and transcription
//! speed factors.

/// Fallback for models missing from the baseline table, in GB.
pub const DEFAULT_MODEL_MEMORY_GB: f64 = 5.0;

/// Baseline device memory requirement for a model in GB.
///
/// These are starting points; the estimator refines them with observed
/// usage but never goes below them.
pub fn base_memory_for(model: &str) -> f64 {
    match model {
        "tiny" | "tiny.en" => 1.0,
        "base" | "base.en" => 1.0,
        "small" | "small.en" => 2.0,
        "medium" | "medium.en" => 5.0,
        "large" | "large-v1" | "large-v2" | "large-v3" => 10.0,
        "turbo" => 6.0,
        _ => DEFAULT_MODEL_MEMORY_GB,
    }
}

/// Expected transcription wall-clock as a fraction of audio duration.
///
/// Drives the worker's time-extrapolated progress reporting; it does not
/// influence memory estimates.
pub fn speed_factor_for(model: &str) -> f64 {
    match model {
        "tiny" | "tiny.en" => 0.10,
        "base" | "base.en" => 0.15,
        "small" | "small.en" => 0.25,
        "medium" | "medium.en" => 0.40,
        "large" | "large-v1" | "large-v2" | "large-v3" => 0.60,
        "turbo" => 0.30,
        _ => 0.40,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_have_baselines() {
        assert_eq!(base_memory_for("tiny"), 1.0);
        assert_eq!(base_memory_for("small"), 2.0);
        assert_eq!(base_memory_for("medium"), 5.0);
        assert_eq!(base_memory_for("large-v3"), 10.0);
        assert_eq!(base_memory_for("turbo"), 6.0);
    }

    #[test]
    fn unknown_model_falls_back() {
        assert_eq!(base_memory_for("gigantic"), DEFAULT_MODEL_MEMORY_GB);
        assert_eq!(speed_factor_for("gigantic"), 0.40);
    }
}
