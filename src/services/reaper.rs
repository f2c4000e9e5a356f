//! Periodic expiry of abandoned upload sessions.

use crate::services::{ServiceResult, now_ts, upload_service::UploadService};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct Reaper {
    uploads: UploadService,
    ttl: Duration,
}

impl Reaper {
    pub fn new(uploads: UploadService) -> Self {
        let ttl = uploads.settings().session_ttl;
        Self { uploads, ttl }
    }

    /// Sweep forever: once after the initial delay, then every interval.
    pub async fn run(self) {
        let settings = self.uploads.settings().clone();
        sleep(settings.reaper_initial_delay).await;

        let mut ticker = interval(settings.reaper_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.run_sweep().await {
                Ok(0) => debug!("no stale upload sessions"),
                Ok(count) => info!(count, "expired stale upload sessions"),
                Err(err) => error!(%err, "upload session sweep failed"),
            }
        }
    }

    /// Expire every session untouched for longer than the TTL and return
    /// how many were removed. One failing session doesn't stop the rest.
    pub async fn run_sweep(&self) -> ServiceResult<usize> {
        let cutoff = now_ts() - self.ttl.as_secs() as i64;
        let stale = self.uploads.sessions().list_stale(cutoff).await?;

        let mut expired = 0;
        for session in stale {
            match self.uploads.expire(&session).await {
                Ok(true) => {
                    expired += 1;
                    debug!(session_id = session.id, "expired upload session");
                }
                Ok(false) => {}
                Err(err) => {
                    error!(
                        session_id = session.id,
                        temp_dir = %session.temp_dir,
                        %err,
                        "failed to expire upload session"
                    );
                }
            }
        }
        Ok(expired)
    }
}
