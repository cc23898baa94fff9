// 🕒 Batch Touch Updater - bump last_modified for changed identities

use crate::store::ProfileStore;
use anyhow::Result;
use chrono::{DateTime, Utc};

pub const DEFAULT_TOUCH_BATCH_SIZE: usize = 1000;

/// Anything that can stamp a batch of identities as modified
pub trait TouchTarget {
    /// Returns how many of the given uuids were found and stamped
    fn touch(&self, uuids: &[String], at: &DateTime<Utc>) -> Result<usize>;
}

impl TouchTarget for ProfileStore {
    fn touch(&self, uuids: &[String], at: &DateTime<Utc>) -> Result<usize> {
        self.touch_identities(uuids, at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchReport {
    /// (requested, affected) per batch; affected never exceeds requested
    pub batches: Vec<(usize, usize)>,
    pub total_affected: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchTouchUpdater {
    batch_size: usize,
}

impl Default for BatchTouchUpdater {
    fn default() -> Self {
        BatchTouchUpdater {
            batch_size: DEFAULT_TOUCH_BATCH_SIZE,
        }
    }
}

impl BatchTouchUpdater {
    pub fn new(batch_size: usize) -> Self {
        BatchTouchUpdater {
            batch_size: batch_size.max(1),
        }
    }

    pub fn touch_all<T: TouchTarget>(&self, target: &T, uuids: &[String]) -> Result<TouchReport> {
        let now = Utc::now();
        let mut report = TouchReport::default();

        for batch in uuids.chunks(self.batch_size) {
            let affected = target.touch(batch, &now)?;
            tracing::debug!(requested = batch.len(), affected, "touched identities");
            report.batches.push((batch.len(), affected));
            report.total_affected += affected;
        }

        Ok(report)
    }
}
