//! Eviction of per-run state after the run leaves the cluster

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

/// Tracks how long each run id has been missing from cluster reads
#[derive(Debug)]
pub struct AbsenceTracker {
    retention: Duration,
    missing_since: HashMap<String, DateTime<Utc>>,
}

impl AbsenceTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            missing_since: HashMap::new(),
        }
    }

    /// Record which tracked ids are absent and return those absent for at
    /// least the retention window. Returned ids are forgotten.
    pub fn sweep<'a>(
        &mut self,
        tracked: impl IntoIterator<Item = &'a String>,
        present: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        self.missing_since.retain(|id, _| !present.contains(id));

        let mut expired = Vec::new();
        for id in tracked.into_iter().filter(|id| !present.contains(*id)) {
            let since = *self.missing_since.entry(id.clone()).or_insert(now);
            if now - since >= self.retention {
                expired.push(id.clone());
            }
        }

        for id in &expired {
            self.missing_since.remove(id);
        }
        expired
    }
}
