//! fallwatch: radar + body-worn IMU fall detection with timed escalation.
//!
//! The receiver fuses a ceiling/wall radar track with motion events sent by
//! a body-worn IMU unit and walks a patient through
//! `NORMAL -> SUSPECT_FALL -> ALERT -> IMMOBILE_TIMEOUT`.

pub mod config;
pub mod error;
pub mod escalation;
pub mod health_monitor;
pub mod link;
pub mod live_status;
pub mod motion_classifier;
pub mod radar_tracker;
pub mod reporter;
pub mod sensor_fusion;
pub mod sensors;
pub mod session;
pub mod smoothing;
pub mod types;

pub use config::EngineConfig;
pub use error::{FallwatchError, Result};
pub use escalation::{EscalationEngine, StatusChange, TransitionReason};
pub use motion_classifier::MotionClassifier;
pub use radar_tracker::RadarTracker;
pub use sensor_fusion::{FusionEvent, ReceiverFusion};
