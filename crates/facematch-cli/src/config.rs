use facematch_core::{DetectorKind, PipelineConfig, StrategyKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing detector, embedder and classifier artifacts.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Upper bound on a single engine request.
    pub timeout: Duration,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facematch");

        let model_dir = var("FACEMATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));

        let db_path = var("FACEMATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("faces.db"));

        let detector: DetectorKind = parse_or(&var, "FACEMATCH_DETECTOR", DetectorKind::default());
        let strategy: StrategyKind = parse_or(&var, "FACEMATCH_STRATEGY", StrategyKind::default());

        let mut pipeline = PipelineConfig::with_model_dir(&model_dir, detector, strategy);
        pipeline.similarity_threshold =
            parse_or(&var, "FACEMATCH_SIMILARITY_THRESHOLD", pipeline.similarity_threshold);
        pipeline.classifier_threshold =
            parse_or(&var, "FACEMATCH_CLASSIFIER_THRESHOLD", pipeline.classifier_threshold);
        pipeline.min_detection_confidence =
            parse_or(&var, "FACEMATCH_DETECTION_CONFIDENCE", pipeline.min_detection_confidence);
        pipeline.embedder.embedding_dim =
            parse_or(&var, "FACEMATCH_EMBEDDING_DIM", pipeline.embedder.embedding_dim);

        Self {
            model_dir,
            db_path,
            timeout: Duration::from_secs(parse_or(&var, "FACEMATCH_TIMEOUT_SECS", 30u64)),
            pipeline,
        }
    }
}

/// Parse `key`, falling back to `default` when unset. Unparseable values are
/// logged and ignored.
fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, value = %raw, error = %e, "ignoring invalid config value");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_vars(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("HOME", "/home/test")]);
        assert_eq!(c.model_dir, PathBuf::from("/home/test/.local/share/facematch/models"));
        assert_eq!(c.db_path, PathBuf::from("/home/test/.local/share/facematch/faces.db"));
        assert_eq!(
            c.pipeline.embedder_model,
            PathBuf::from("/home/test/.local/share/facematch/models/facenet.onnx")
        );
        assert_eq!(c.timeout, Duration::from_secs(30));
        assert_eq!(c.pipeline.detector, DetectorKind::Scrfd);
        assert_eq!(c.pipeline.strategy, StrategyKind::Similarity);
        assert!((c.pipeline.similarity_threshold - 0.6).abs() < 1e-6);
        assert!((c.pipeline.classifier_threshold - 0.5).abs() < 1e-6);
        assert!((c.pipeline.min_detection_confidence - 0.9).abs() < 1e-6);
        assert_eq!(c.pipeline.embedder.embedding_dim, 128);
    }

    #[test]
    fn test_xdg_data_home() {
        let c = config(&[("XDG_DATA_HOME", "/xdg"), ("HOME", "/home/test")]);
        assert_eq!(c.model_dir, PathBuf::from("/xdg/facematch/models"));
        assert_eq!(c.db_path, PathBuf::from("/xdg/facematch/faces.db"));
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("FACEMATCH_MODEL_DIR", "/models"),
            ("FACEMATCH_DB_PATH", "/data/g.db"),
            ("FACEMATCH_DETECTOR", "cascade"),
            ("FACEMATCH_STRATEGY", "classifier"),
            ("FACEMATCH_SIMILARITY_THRESHOLD", "0.7"),
            ("FACEMATCH_TIMEOUT_SECS", "5"),
            ("FACEMATCH_EMBEDDING_DIM", "512"),
        ]);
        assert_eq!(c.model_dir, PathBuf::from("/models"));
        assert_eq!(c.db_path, PathBuf::from("/data/g.db"));
        assert_eq!(c.pipeline.detector, DetectorKind::Cascade);
        assert_eq!(
            c.pipeline.detector_model,
            PathBuf::from("/models").join(DetectorKind::Cascade.model_file())
        );
        assert_eq!(c.pipeline.strategy, StrategyKind::Classifier);
        assert!((c.pipeline.similarity_threshold - 0.7).abs() < 1e-6);
        assert_eq!(c.timeout, Duration::from_secs(5));
        assert_eq!(c.pipeline.embedder.embedding_dim, 512);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let c = config(&[
            ("FACEMATCH_SIMILARITY_THRESHOLD", "high"),
            ("FACEMATCH_DETECTOR", "mtcnn"),
        ]);
        assert!((c.pipeline.similarity_threshold - 0.6).abs() < 1e-6);
        assert_eq!(c.pipeline.detector, DetectorKind::Scrfd);
    }
}
