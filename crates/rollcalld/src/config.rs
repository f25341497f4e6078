use chrono::Duration;
use rollcall_attendance::{ScheduleError, ScheduleWindow, SessionPolicy};
use rollcall_core::{EnrollmentPolicy, QualityGate, ScrfdOptions};
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// Grace past a slot's end never exceeds one week.
const MAX_GRACE_MINUTES: i64 = 7 * 24 * 60;
const MAX_ENGINE_TIMEOUT_SECS: u64 = 600;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub embedder_model: String,
    /// ONNX Runtime intra-op threads per model.
    pub model_threads: usize,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub bus: Bus,
    /// Cosine-distance threshold for check-in recognition.
    pub recognition_threshold: f32,
    pub checkout_threshold: f32,
    pub duplicate_threshold: f32,
    pub grace_minutes: i64,
    pub sweep_interval_secs: u64,
    /// Timeout in seconds for a single engine call.
    pub engine_timeout_secs: u64,
    /// Timetable zone, minutes east of UTC.
    pub utc_offset_minutes: i32,
    pub min_face_px: f32,
    pub blur_floor: f64,
    pub min_luminance: f32,
    pub max_luminance: f32,
    pub augmentations: usize,
    pub require_single_face: bool,
    /// TOML timetable imported at startup.
    pub timetable_path: Option<PathBuf>,
    /// Close a session when its holder is recognized this close to the slot end.
    pub recognition_checkout_minutes: Option<i64>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let parse_or = |key: &str, default| parse_var(&var, key).unwrap_or(default);

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            model_dir: var("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            detector_model: var("ROLLCALL_DETECTOR_MODEL").unwrap_or_else(|| "det_10g.onnx".to_string()),
            embedder_model: var("ROLLCALL_EMBEDDER_MODEL").unwrap_or_else(|| "w600k_r50.onnx".to_string()),
            model_threads: parse_var(&var, "ROLLCALL_MODEL_THREADS").unwrap_or(2),
            db_path: var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            bus: match var("ROLLCALL_BUS").as_deref() {
                Some("system") => Bus::System,
                _ => Bus::Session,
            },
            recognition_threshold: parse_or("ROLLCALL_RECOGNITION_THRESHOLD", 0.6),
            checkout_threshold: parse_or("ROLLCALL_CHECKOUT_THRESHOLD", 0.6),
            duplicate_threshold: parse_or("ROLLCALL_DUPLICATE_THRESHOLD", 0.7),
            grace_minutes: parse_in_range(&var, "ROLLCALL_GRACE_MINUTES", 0..=MAX_GRACE_MINUTES).unwrap_or(30),
            sweep_interval_secs: parse_var(&var, "ROLLCALL_SWEEP_INTERVAL_SECS").unwrap_or(300),
            engine_timeout_secs: parse_in_range(&var, "ROLLCALL_ENGINE_TIMEOUT_SECS", 1..=MAX_ENGINE_TIMEOUT_SECS)
                .unwrap_or(15),
            utc_offset_minutes: parse_var(&var, "ROLLCALL_UTC_OFFSET_MINUTES").unwrap_or(0),
            min_face_px: parse_or("ROLLCALL_MIN_FACE_PX", 50.0),
            blur_floor: parse_var(&var, "ROLLCALL_BLUR_FLOOR").unwrap_or(100.0),
            min_luminance: parse_or("ROLLCALL_MIN_LUMINANCE", 50.0),
            max_luminance: parse_or("ROLLCALL_MAX_LUMINANCE", 200.0),
            augmentations: parse_var(&var, "ROLLCALL_AUGMENTATIONS").unwrap_or(4),
            require_single_face: var("ROLLCALL_REQUIRE_SINGLE_FACE")
                .map(|v| v != "0")
                .unwrap_or(true),
            timetable_path: var("ROLLCALL_TIMETABLE").map(PathBuf::from),
            recognition_checkout_minutes: parse_var(&var, "ROLLCALL_RECOGNITION_CHECKOUT_MINUTES"),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir.join(&self.detector_model).to_string_lossy().into_owned()
    }

    /// Path to the ArcFace embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir.join(&self.embedder_model).to_string_lossy().into_owned()
    }

    pub fn scrfd_options(&self) -> ScrfdOptions {
        ScrfdOptions {
            intra_threads: self.model_threads,
            ..ScrfdOptions::default()
        }
    }

    pub fn quality_gate(&self) -> QualityGate {
        QualityGate {
            min_face_px: self.min_face_px,
            blur_floor: self.blur_floor,
            min_luminance: self.min_luminance,
            max_luminance: self.max_luminance,
        }
    }

    pub fn enrollment_policy(&self) -> EnrollmentPolicy {
        EnrollmentPolicy {
            require_single_face: self.require_single_face,
            augmentations: self.augmentations,
            ..EnrollmentPolicy::default()
        }
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            grace: Duration::minutes(self.grace_minutes),
            checkout_threshold: self.checkout_threshold,
            duplicate_threshold: self.duplicate_threshold,
            recognition_checkout: self.recognition_checkout_minutes.map(Duration::minutes),
        }
    }

    pub fn schedule_window(&self) -> Result<ScheduleWindow, ScheduleError> {
        ScheduleWindow::from_offset_minutes(self.utc_offset_minutes)
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn parse_in_range<T>(var: &impl Fn(&str) -> Option<String>, key: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display,
{
    let value = parse_var(var, key)?;
    if range.contains(&value) {
        Some(value)
    } else {
        tracing::warn!(
            key,
            %value,
            min = %range.start(),
            max = %range.end(),
            "ignoring out-of-range setting"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("HOME", "/home/prof")]);
        assert_eq!(c.db_path, PathBuf::from("/home/prof/.local/share/rollcall/attendance.db"));
        assert_eq!(c.bus, Bus::Session);
        assert!((c.recognition_threshold - 0.6).abs() < 1e-6);
        assert!((c.duplicate_threshold - 0.7).abs() < 1e-6);
        assert_eq!(c.session_policy().grace, Duration::minutes(30));
        assert_eq!(c.session_policy().recognition_checkout, None);
        assert_eq!(c.sweep_interval_secs, 300);
        assert_eq!(c.engine_timeout_secs, 15);
        assert_eq!(c.quality_gate(), QualityGate::default());
        assert!(c.enrollment_policy().require_single_face);
        assert_eq!(c.enrollment_policy().augmentations, 4);
        assert!(c.timetable_path.is_none());
        assert!(c.detector_model_path().ends_with("det_10g.onnx"));
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("ROLLCALL_BUS", "system"),
            ("ROLLCALL_GRACE_MINUTES", "10"),
            ("ROLLCALL_UTC_OFFSET_MINUTES", "-300"),
            ("ROLLCALL_REQUIRE_SINGLE_FACE", "0"),
            ("ROLLCALL_RECOGNITION_CHECKOUT_MINUTES", "15"),
            ("ROLLCALL_TIMETABLE", "/etc/rollcall/timetable.toml"),
        ]);
        assert_eq!(c.bus, Bus::System);
        assert_eq!(c.session_policy().grace, Duration::minutes(10));
        assert_eq!(c.session_policy().recognition_checkout, Some(Duration::minutes(15)));
        assert_eq!(c.schedule_window().unwrap().offset().local_minus_utc(), -300 * 60);
        assert!(!c.enrollment_policy().require_single_face);
        assert_eq!(c.timetable_path, Some(PathBuf::from("/etc/rollcall/timetable.toml")));
    }

    #[test]
    fn test_garbage_falls_back_to_default() {
        let c = config(&[("ROLLCALL_SWEEP_INTERVAL_SECS", "often"), ("ROLLCALL_CHECKOUT_THRESHOLD", "x")]);
        assert_eq!(c.sweep_interval_secs, 300);
        assert!((c.checkout_threshold - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_range_falls_back_to_default() {
        for grace in ["-10", "9223372036854775807"] {
            let c = config(&[("ROLLCALL_GRACE_MINUTES", grace), ("ROLLCALL_ENGINE_TIMEOUT_SECS", "0")]);
            assert_eq!(c.grace_minutes, 30);
            assert_eq!(c.session_policy().grace, Duration::minutes(30));
            assert_eq!(c.engine_timeout_secs, 15);
        }

        let c = config(&[("ROLLCALL_GRACE_MINUTES", "0"), ("ROLLCALL_ENGINE_TIMEOUT_SECS", "1")]);
        assert_eq!(c.session_policy().grace, Duration::zero());
        assert_eq!(c.engine_timeout_secs, 1);
    }
}
