//! Engine liveness state for the health probes.
//!
//! The scheduler loop stamps a heartbeat every iteration; the probes read
//! three facts: has the engine started (executor reachable, threads
//! spawned), has it finished initializing, and has the loop run recently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Executor is not connected / the engine never started.
pub const ERROR_SERVER_NOT_READY: i32 = 1;
/// The engine started but is not (or no longer) initialized.
pub const ERROR_ENGINE_DOWN: i32 = 2;
/// The engine loop has not run within the health interval.
pub const ERROR_ENGINE_HANG: i32 = 3;

/// Probe failure body, serialized as `{error_code, error_msg}`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthError {
    pub error_code: i32,
    pub error_msg: String,
}

pub struct HealthState {
    started: AtomicBool,
    engine_ready: AtomicBool,
    /// Milliseconds since `origin` of the last heartbeat; 0 means never.
    heartbeat_ms: AtomicU64,
    origin: Instant,
    check_interval: Duration,
}

impl HealthState {
    pub fn new(check_health_interval_secs: u64) -> Self {
        Self {
            started: AtomicBool::new(false),
            engine_ready: AtomicBool::new(false),
            heartbeat_ms: AtomicU64::new(0),
            origin: Instant::now(),
            check_interval: Duration::from_secs(check_health_interval_secs),
        }
    }

    /// The executor is connected and the engine threads are spawned.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// The engine loop is up and serving.
    pub fn mark_ready(&self) {
        self.engine_ready.store(true, Ordering::Release);
    }

    pub fn heartbeat(&self) {
        let elapsed = self.origin.elapsed().as_millis().max(1) as u64;
        self.heartbeat_ms.store(elapsed, Ordering::Release);
    }

    /// Readiness: can this process accept work at all.
    pub fn check_ready(&self) -> Result<(), HealthError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(HealthError {
                error_code: ERROR_SERVER_NOT_READY,
                error_msg: "server is not ready".to_string(),
            });
        }
        Ok(())
    }

    /// Liveness: the engine is initialized and its loop ran recently.
    pub fn check_live(&self) -> Result<(), HealthError> {
        self.check_ready()?;
        if !self.engine_ready.load(Ordering::Acquire) {
            return Err(HealthError {
                error_code: ERROR_ENGINE_DOWN,
                error_msg: "infer engine is down".to_string(),
            });
        }
        let last = self.heartbeat_ms.load(Ordering::Acquire);
        if last > 0 {
            let age = self.origin.elapsed().saturating_sub(Duration::from_millis(last));
            if age > self.check_interval {
                return Err(HealthError {
                    error_code: ERROR_ENGINE_HANG,
                    error_msg: "infer engine hangs".to_string(),
                });
            }
        }
        Ok(())
    }
}
