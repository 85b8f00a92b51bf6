//! Durable job queue on Postgres: named queues, lease-based at-least-once
//! delivery (`for update skip locked`), exponential retry, delayed enqueue
//! and bounded completed/failed history.

use crate::Db;
use anyhow::{Context, Result};
use sqlx::Row;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    NewDataItem,
    PlanBundle,
    PrepareBundle,
    PostBundle,
    SeedBundle,
    VerifyBundle,
    OpticalPost,
    UnbundleBdi,
    FinalizeUpload,
    PutOffsets,
    CleanupFs,
}

impl Queue {
    pub const ALL: &'static [Queue] = &[
        Queue::NewDataItem,
        Queue::PlanBundle,
        Queue::PrepareBundle,
        Queue::PostBundle,
        Queue::SeedBundle,
        Queue::VerifyBundle,
        Queue::OpticalPost,
        Queue::UnbundleBdi,
        Queue::FinalizeUpload,
        Queue::PutOffsets,
        Queue::CleanupFs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewDataItem => "new-data-item",
            Self::PlanBundle => "plan-bundle",
            Self::PrepareBundle => "prepare-bundle",
            Self::PostBundle => "post-bundle",
            Self::SeedBundle => "seed-bundle",
            Self::VerifyBundle => "verify-bundle",
            Self::OpticalPost => "optical-post",
            Self::UnbundleBdi => "unbundle-bdi",
            Self::FinalizeUpload => "finalize-upload",
            Self::PutOffsets => "put-offsets",
            Self::CleanupFs => "cleanup-fs",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|q| q.as_str() == s)
            .with_context(|| format!("unknown queue: {s}"))
    }

    /// How long a leased job may run before another worker can take it over.
    pub fn lease_for(self) -> Duration {
        match self {
            // Chunk seeding streams a whole bundle payload.
            Self::SeedBundle => Duration::from_secs(300),
            _ => Duration::from_secs(60),
        }
    }
}

/// Exponential backoff from 5s, capped at 5 minutes.
pub fn retry_delay(attempts: i32) -> Duration {
    let shift = u32::try_from(attempts.clamp(0, 6)).unwrap_or(0);
    let base = 5u64.checked_shl(shift).unwrap_or(u64::MAX);
    Duration::from_secs(base.min(300))
}

/// Next occurrence of a daily `"M H * * *"` cron pattern strictly after
/// `after` (epoch seconds). Only the minute/hour form is supported; that is
/// the only repeatable schedule the service runs.
pub fn next_cron_occurrence(pattern: &str, after: i64) -> Result<i64> {
    let fields: Vec<&str> = pattern.split_whitespace().collect();
    if fields.len() != 5 || fields[2] != "*" || fields[3] != "*" || fields[4] != "*" {
        anyhow::bail!("unsupported cron pattern: {pattern} (expected \"M H * * *\")");
    }
    let minute: i64 = fields[0]
        .parse()
        .with_context(|| format!("cron minute field: {}", fields[0]))?;
    let hour: i64 = fields[1]
        .parse()
        .with_context(|| format!("cron hour field: {}", fields[1]))?;
    if !(0..60).contains(&minute) || !(0..24).contains(&hour) {
        anyhow::bail!("cron fields out of range: {pattern}");
    }

    let seconds_into_day = hour * 3600 + minute * 60;
    let day_start = after.div_euclid(86_400) * 86_400;
    let candidate = day_start + seconds_into_day;
    if candidate > after {
        Ok(candidate)
    } else {
        Ok(candidate + 86_400)
    }
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_id: i64,
    pub queue: Queue,
    pub payload: serde_json::Value,
    pub attempts: i32,
}

impl Db {
    /// Enqueues a job. `dedupe_key` collapses duplicate ready jobs per queue;
    /// `delay` postpones the first delivery.
    pub async fn enqueue_job(
        &self,
        queue: Queue,
        payload: &serde_json::Value,
        dedupe_key: Option<&str>,
        delay: Duration,
    ) -> Result<()> {
        let delay_secs: i64 = delay.as_secs().try_into().unwrap_or(0);
        sqlx::query(
            "insert into bundler.jobs(queue, payload, dedupe_key, next_retry_at) \
             values ($1, $2, $3, now() + make_interval(secs => $4)) \
             on conflict (queue, dedupe_key) where dedupe_key is not null and state = 'ready' \
             do nothing",
        )
        .bind(queue.as_str())
        .bind(payload.to_string())
        .bind(dedupe_key)
        .bind(delay_secs)
        .execute(&self.pool)
        .await
        .context("insert bundler.jobs")?;
        Ok(())
    }

    /// Leases up to `limit` due jobs from one queue. A lease held by this
    /// worker is renewed; an expired lease is taken over.
    pub async fn lease_jobs(
        &self,
        queue: Queue,
        leased_by: &str,
        limit: i64,
    ) -> Result<Vec<JobRow>> {
        let secs: i64 = queue.lease_for().as_secs().try_into().unwrap_or(60);
        let rows = sqlx::query(
            "with cte as ( \
                select job_id \
                from bundler.jobs \
                where queue = $1 \
                  and state = 'ready' \
                  and next_retry_at <= now() \
                  and ( \
                      (lease_until is null or lease_until < now()) \
                      or (leased_by = $2 and lease_until >= now()) \
                  ) \
                order by job_id asc \
                limit $3 \
                for update skip locked \
            ) \
            update bundler.jobs j set \
                leased_by = $2, \
                lease_until = now() + make_interval(secs => $4), \
                updated_at = now() \
            from cte \
            where j.job_id = cte.job_id \
            returning j.job_id, j.queue, j.payload, j.attempts",
        )
        .bind(queue.as_str())
        .bind(leased_by)
        .bind(limit)
        .bind(secs)
        .fetch_all(&self.pool)
        .await
        .context("lease bundler.jobs")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            out.push(JobRow {
                job_id: row.try_get("job_id")?,
                queue: Queue::parse(row.try_get::<String, _>("queue")?.as_str())?,
                payload: serde_json::from_str(&payload).context("decode job payload")?,
                attempts: row.try_get("attempts")?,
            });
        }
        Ok(out)
    }

    pub async fn complete_job(&self, job_id: i64, leased_by: &str) -> Result<()> {
        let n = sqlx::query(
            "update bundler.jobs set \
                state = 'done', finished_at = now(), updated_at = now() \
             where job_id = $1 and leased_by = $2 and lease_until >= now()",
        )
        .bind(job_id)
        .bind(leased_by)
        .execute(&self.pool)
        .await
        .context("complete job")?
        .rows_affected();
        if n != 1 {
            anyhow::bail!("lost job lease for job_id={job_id}");
        }
        Ok(())
    }

    /// Records a retryable failure. Past the attempt bound the job moves to
    /// the failed history (dead-letter) instead of being retried.
    pub async fn record_job_retryable(
        &self,
        job_id: i64,
        leased_by: &str,
        err: &str,
        next_retry_in: Duration,
    ) -> Result<()> {
        let secs: i64 = next_retry_in.as_secs().try_into().unwrap_or(5);
        let n = sqlx::query(
            "update bundler.jobs set \
                attempts = attempts + 1, \
                last_error = $1, \
                state = case when attempts + 1 >= max_attempts then 'failed' else 'ready' end, \
                finished_at = case when attempts + 1 >= max_attempts then now() else null end, \
                next_retry_at = now() + make_interval(secs => $2), \
                lease_until = now(), \
                updated_at = now() \
             where job_id = $3 and leased_by = $4",
        )
        .bind(err)
        .bind(secs)
        .bind(job_id)
        .bind(leased_by)
        .execute(&self.pool)
        .await
        .context("record retryable job error")?
        .rows_affected();
        if n != 1 {
            anyhow::bail!("lost job lease for job_id={job_id}");
        }
        Ok(())
    }

    pub async fn record_job_fatal(&self, job_id: i64, leased_by: &str, err: &str) -> Result<()> {
        let n = sqlx::query(
            "update bundler.jobs set \
                state = 'failed', \
                last_error = $1, \
                finished_at = now(), \
                lease_until = now(), \
                updated_at = now() \
             where job_id = $2 and leased_by = $3",
        )
        .bind(err)
        .bind(job_id)
        .bind(leased_by)
        .execute(&self.pool)
        .await
        .context("record fatal job error")?
        .rows_affected();
        if n != 1 {
            anyhow::bail!("lost job lease for job_id={job_id}");
        }
        Ok(())
    }

    /// Bounded history: completed jobs kept at most 1000 rows / 24h, failed
    /// at most 5000 rows / 7d.
    pub async fn trim_job_history(&self) -> Result<()> {
        for (state, keep_rows, keep_secs) in
            [("done", 1_000i64, 86_400i64), ("failed", 5_000, 604_800)]
        {
            sqlx::query(
                "delete from bundler.jobs \
                 where state = $1 \
                   and ( \
                       finished_at < now() - make_interval(secs => $2) \
                       or job_id not in ( \
                           select job_id from bundler.jobs \
                           where state = $1 \
                           order by finished_at desc nulls last \
                           limit $3 \
                       ) \
                   )",
            )
            .bind(state)
            .bind(keep_secs)
            .bind(keep_rows)
            .execute(&self.pool)
            .await
            .context("trim job history")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_roundtrip() {
        for q in Queue::ALL {
            assert_eq!(Queue::parse(q.as_str()).unwrap(), *q);
        }
        assert!(Queue::parse("no-such-queue").is_err());
    }

    #[test]
    fn seed_bundle_gets_the_long_lease() {
        assert_eq!(Queue::SeedBundle.lease_for(), Duration::from_secs(300));
        assert_eq!(Queue::PostBundle.lease_for(), Duration::from_secs(60));
    }

    #[test]
    fn retry_delay_starts_at_five_seconds_and_caps() {
        assert_eq!(retry_delay(0), Duration::from_secs(5));
        assert_eq!(retry_delay(1), Duration::from_secs(10));
        assert_eq!(retry_delay(2), Duration::from_secs(20));
        let mut prev = Duration::ZERO;
        for attempts in 0..=12 {
            let d = retry_delay(attempts);
            assert!(d >= prev, "regressed at attempts={attempts}");
            assert!(d <= Duration::from_secs(300));
            prev = d;
        }
        assert_eq!(retry_delay(i32::MAX), Duration::from_secs(300));
        assert_eq!(retry_delay(-3), Duration::from_secs(5));
    }

    #[test]
    fn cron_next_occurrence_same_day_and_next_day() {
        // 2am daily. After midnight the same day's 2am is next.
        let midnight = 1_700_000_000 - (1_700_000_000 % 86_400);
        let two_am = midnight + 2 * 3600;
        assert_eq!(next_cron_occurrence("0 2 * * *", midnight).unwrap(), two_am);
        // Exactly at 2am the next day's run is next (strictly after).
        assert_eq!(
            next_cron_occurrence("0 2 * * *", two_am).unwrap(),
            two_am + 86_400
        );
        assert_eq!(
            next_cron_occurrence("0 2 * * *", two_am + 1).unwrap(),
            two_am + 86_400
        );
        assert_eq!(
            next_cron_occurrence("30 23 * * *", midnight).unwrap(),
            midnight + 23 * 3600 + 30 * 60
        );
    }

    #[test]
    fn cron_rejects_unsupported_patterns() {
        assert!(next_cron_occurrence("0 2 * * 1", 0).is_err());
        assert!(next_cron_occurrence("*/5 * * * *", 0).is_err());
        assert!(next_cron_occurrence("61 2 * * *", 0).is_err());
        assert!(next_cron_occurrence("0 24 * * *", 0).is_err());
        assert!(next_cron_occurrence("garbage", 0).is_err());
    }
}
