//! Background Sync Scheduler
//!
//! Periodic automatic pulls for all entity types at a configurable
//! interval. Uses a Tokio task for non-blocking background execution;
//! the per-entity mutual-exclusion guard in the pull service keeps a slow
//! scheduled run from overlapping a manual one.

use super::manager::SyncManager;
use super::pull::PullOptions;
use crate::db::Database;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const SETTING_KEY: &str = "scheduler_config";

/// Scheduler configuration stored in the settings table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            last_run: None,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

/// Background scheduler for automatic ledger pulls
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl BackgroundScheduler {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from the settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self
            .db
            .get_setting(SETTING_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to the settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(SETTING_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start the background task
    pub async fn start(
        &self,
        manager_ref: Arc<StdMutex<Option<SyncManager>>>,
    ) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        self.running.store(true, Ordering::Relaxed);

        let running = self.running.clone();
        let db = self.db.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            Self::scheduler_loop(running, db, config, manager_ref).await;
        });

        *self.task_handle.lock().unwrap() = Some(handle);

        log::info!(
            "Background scheduler started (interval: {} minutes)",
            interval_minutes
        );
        Ok(())
    }

    /// Stop the background task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::NotRunning);
        }

        self.running.store(false, Ordering::Relaxed);

        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration, restarting the task when needed
    pub async fn update_config(
        &self,
        enabled: bool,
        interval_minutes: u64,
        manager_ref: Arc<StdMutex<Option<SyncManager>>>,
    ) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }

        self.save_config().await?;

        if self.is_running() {
            // Ignore error if the task raced to completion
            let _ = self.stop().await;
        }

        if enabled {
            self.start(manager_ref).await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} minutes",
            enabled,
            interval_minutes
        );
        Ok(())
    }

    /// Scheduler loop (runs in the spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        manager_ref: Arc<StdMutex<Option<SyncManager>>>,
    ) {
        let interval_minutes = config.read().await.interval_minutes;
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(60 * interval_minutes));
        // The first tick fires immediately; skip it so a fresh start waits
        // one full interval before pulling
        interval.tick().await;

        log::info!(
            "Scheduler loop started (interval: {} minutes)",
            interval_minutes
        );

        loop {
            interval.tick().await;

            if !running.load(Ordering::Relaxed) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            let manager = match manager_ref.lock() {
                Ok(guard) => match guard.as_ref() {
                    Some(manager) => manager.clone(),
                    None => {
                        log::warn!("Sync manager not initialized, skipping scheduled pull");
                        continue;
                    }
                },
                Err(e) => {
                    log::error!("Failed to lock sync manager: {}", e);
                    continue;
                }
            };

            log::info!("Scheduled ledger pull triggered");
            let result = manager.pull_all(None, &PullOptions::default()).await;

            for (entity, outcome) in &result.outcomes {
                log::info!(
                    "Scheduled {} pull: {} processed, {} created, {} skipped, {} failed",
                    entity,
                    outcome.stats.processed,
                    outcome.stats.succeeded,
                    outcome.stats.skipped,
                    outcome.stats.failed
                );
            }
            for error in &result.errors {
                log::error!("Scheduled pull failed: {}", error);
            }

            let mut cfg = config.write().await;
            cfg.last_run = Some(Utc::now().to_rfc3339());
            let snapshot = cfg.clone();
            drop(cfg);

            if let Err(e) = db.set_setting(SETTING_KEY, &snapshot) {
                log::error!("Failed to save last_run timestamp: {}", e);
            }
        }

        log::info!("Scheduler loop exited");
    }
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(1..=1440).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be 1-1440 minutes, got {}",
            interval_minutes
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
