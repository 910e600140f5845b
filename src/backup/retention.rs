use crate::backup::destination::ArchiveObject;
use bon::Builder;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use derive_more::Display;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use validator::Validate;

/// Bucketed retention: the newest archive of each of the last N calendar
/// days, ISO weeks and months survives, and nothing older than `max_age`
/// does. Buckets are counted back from "now" in UTC.
#[derive(Clone, Debug, Validate, Serialize, Deserialize, Builder, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_keep_daily")]
    #[builder(default = default_keep_daily())]
    pub keep_daily: u32,
    #[serde(default = "default_keep_weekly")]
    #[builder(default = default_keep_weekly())]
    pub keep_weekly: u32,
    #[serde(default = "default_keep_monthly")]
    #[builder(default = default_keep_monthly())]
    pub keep_monthly: u32,
    #[serde(with = "humantime_serde", default = "default_max_age")]
    #[builder(default = default_max_age())]
    pub max_age: std::time::Duration,
    /// Log decisions without deleting anything
    #[serde(default)]
    #[builder(default)]
    pub dry_run: bool,
}

fn default_keep_daily() -> u32 {
    7
}

fn default_keep_weekly() -> u32 {
    4
}

fn default_keep_monthly() -> u32 {
    6
}

fn default_max_age() -> std::time::Duration {
    std::time::Duration::from_secs(90 * 24 * 60 * 60)
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepReason {
    Daily,
    Weekly,
    Monthly,
    Newest,
    /// Needed to restore a retained incremental archive
    Base,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    MaxAge,
    /// Its base chain reaches an archive past `max_age`
    BaseExpired,
    NoBucket,
}

#[derive(Clone, Debug, Serialize)]
pub struct Kept {
    pub object: ArchiveObject,
    pub reasons: BTreeSet<KeepReason>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Deleted {
    pub object: ArchiveObject,
    pub reason: DeleteReason,
}

/// Outcome of a retention pass, both lists newest first
#[derive(Clone, Debug, Default, Serialize)]
pub struct RetentionPlan {
    pub keep: Vec<Kept>,
    pub delete: Vec<Deleted>,
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn month_index(date: NaiveDate) -> i64 {
    date.year() as i64 * 12 + date.month0() as i64
}

/// Walks a bucket sequence newest first and claims the first archive seen
/// in each bucket that is within `limit` buckets of now.
fn claim_buckets<F>(
    objects: &[ArchiveObject],
    limit: u32,
    buckets_ago: F,
    reason: KeepReason,
    reasons: &mut HashMap<String, BTreeSet<KeepReason>>,
) where
    F: Fn(&ArchiveObject) -> i64,
{
    let mut claimed = HashSet::new();
    for object in objects {
        let ago = buckets_ago(object).max(0);
        if ago < limit as i64 && claimed.insert(ago) {
            reasons.entry(object.key.clone()).or_default().insert(reason);
        }
    }
}

impl RetentionConfig {
    /// `base_of` maps an incremental archive key to the key of its base.
    ///
    /// `max_age` is absolute: an expired archive is never kept, not even as
    /// a base, and incrementals whose chain reaches one go with it.
    pub fn plan(
        &self,
        objects: &[ArchiveObject],
        base_of: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> RetentionPlan {
        let max_age = Duration::from_std(self.max_age).unwrap_or(Duration::MAX);
        let objects = objects
            .iter()
            .cloned()
            .sorted_by(|a, b| b.created.cmp(&a.created).then_with(|| b.key.cmp(&a.key)))
            .collect_vec();
        let expired = |o: &ArchiveObject| now.signed_duration_since(o.created) > max_age;
        let expired_keys: HashSet<String> = objects
            .iter()
            .filter(|o| expired(o))
            .map(|o| o.key.clone())
            .collect();
        let base_expired = |key: &str| {
            let mut seen = HashSet::new();
            let mut current = key;
            while let Some(base) = base_of.get(current) {
                if expired_keys.contains(base.as_str()) {
                    return true;
                }
                if !seen.insert(base.as_str()) {
                    break;
                }
                current = base.as_str();
            }
            false
        };
        let live = objects
            .iter()
            .filter(|o| !expired(o) && !base_expired(&o.key))
            .cloned()
            .collect_vec();

        let today = now.date_naive();
        let mut reasons: HashMap<String, BTreeSet<KeepReason>> = HashMap::new();
        claim_buckets(
            &live,
            self.keep_daily,
            |o| (today - o.created.date_naive()).num_days(),
            KeepReason::Daily,
            &mut reasons,
        );
        claim_buckets(
            &live,
            self.keep_weekly,
            |o| (week_start(today) - week_start(o.created.date_naive())).num_days() / 7,
            KeepReason::Weekly,
            &mut reasons,
        );
        claim_buckets(
            &live,
            self.keep_monthly,
            |o| month_index(today) - month_index(o.created.date_naive()),
            KeepReason::Monthly,
            &mut reasons,
        );
        if let Some(newest) = live.first() {
            reasons
                .entry(newest.key.clone())
                .or_default()
                .insert(KeepReason::Newest);
        }

        let retainable: HashSet<&str> = live.iter().map(|o| o.key.as_str()).collect();
        let mut pending = reasons.keys().cloned().collect_vec();
        while let Some(key) = pending.pop() {
            if let Some(base) = base_of.get(&key).filter(|b| retainable.contains(b.as_str())) {
                let entry = reasons.entry(base.clone()).or_default();
                if entry.insert(KeepReason::Base) {
                    pending.push(base.clone());
                }
            }
        }

        let mut plan = RetentionPlan::default();
        for object in objects {
            match reasons.remove(&object.key) {
                Some(reasons) => plan.keep.push(Kept { object, reasons }),
                None => {
                    let reason = if expired(&object) {
                        DeleteReason::MaxAge
                    } else if base_expired(&object.key) {
                        DeleteReason::BaseExpired
                    } else {
                        DeleteReason::NoBucket
                    };
                    plan.delete.push(Deleted { object, reason });
                }
            }
        }
        plan
    }
}
