//! Fires cron-triggered executions.
//!
//! The schedule bookkeeping lives on the pipeline itself (`status.next_start`)
//! so a restarted controller picks up exactly where it left off. Missed fires
//! are never replayed: a `next_start` further in the past than one sync
//! interval resets the schedule instead of firing.

use crate::models::execution::{PipelineExecution, TriggerContext, TriggerType};
use crate::models::pipeline::Pipeline;
use crate::models::{Selector, CRON_LABEL};
use crate::provider;
use crate::repository::Repository;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, SecondsFormat};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CronSyncer {
    repository: Arc<dyn Repository>,
    providers: provider::Registry,
    interval: Duration,
    enabled: bool,
}

impl CronSyncer {
    pub fn new(
        repository: Arc<dyn Repository>,
        providers: provider::Registry,
        interval: Duration,
        enabled: bool,
    ) -> Self {
        CronSyncer {
            repository,
            providers,
            interval,
            enabled,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Cron syncer shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync_once().await {
                        error!(error = %e, "Could not list pipelines for cron sync");
                    }
                }
            }
        }
    }

    pub async fn sync_once(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let pipelines = self
            .repository
            .list_pipelines(&Selector::new().eq(CRON_LABEL, "true"))
            .await?;

        for pipeline in pipelines {
            if !pipeline.has_cron_trigger() {
                continue;
            }
            let namespace = pipeline.meta.namespace.clone();
            let name = pipeline.meta.name.clone();
            if let Err(e) = self.sync_pipeline(pipeline).await {
                error!(
                    namespace = namespace,
                    pipeline = name,
                    error = %e,
                    "Could not sync cron schedule"
                );
            }
        }
        Ok(())
    }

    async fn sync_pipeline(&self, mut pipeline: Pipeline) -> Result<()> {
        let now = Local::now();

        // First sight of the schedule: compute the fire time and stop. Firing
        // on the same tick the schedule appears would surprise users.
        if pipeline.status.next_start.is_empty() {
            let next = next_start_time(
                &pipeline.spec.trigger_cron_expression,
                &pipeline.spec.trigger_cron_timezone,
                now,
            )?;
            pipeline.status.next_start = next.to_rfc3339_opts(SecondsFormat::Secs, true);
            self.repository.update_pipeline(&pipeline).await?;
            return Ok(());
        }

        let next_start = match DateTime::parse_from_rfc3339(&pipeline.status.next_start) {
            Ok(parsed) => parsed.with_timezone(&Local),
            Err(e) => {
                // Corrupt bookkeeping heals itself by starting over.
                warn!(
                    namespace = pipeline.meta.namespace,
                    pipeline = pipeline.meta.name,
                    next_start = pipeline.status.next_start,
                    error = %e,
                    "Could not parse next start time; resetting schedule"
                );
                pipeline.status.next_start.clear();
                self.repository.update_pipeline(&pipeline).await?;
                return Ok(());
            }
        };

        if next_start > now {
            return Ok(());
        }

        let overdue = now.signed_duration_since(next_start);
        if overdue
            > chrono::Duration::from_std(self.interval)
                .context("sync interval does not fit a chrono duration")?
        {
            // The fire window was missed entirely (controller downtime).
            // Cron does not catch up; reset and wait for the next occurrence.
            warn!(
                namespace = pipeline.meta.namespace,
                pipeline = pipeline.meta.name,
                next_start = pipeline.status.next_start,
                "Missed cron window; resetting schedule without firing"
            );
            pipeline.status.next_start.clear();
            self.repository.update_pipeline(&pipeline).await?;
            return Ok(());
        }

        // On time: advance the schedule first so a failure to create the
        // execution can never fire the same occurrence twice.
        let next = next_start_time(
            &pipeline.spec.trigger_cron_expression,
            &pipeline.spec.trigger_cron_timezone,
            now,
        )?;
        pipeline.status.next_start = next.to_rfc3339_opts(SecondsFormat::Secs, true);
        let pipeline = self.repository.update_pipeline(&pipeline).await?;

        self.trigger(&pipeline).await
    }

    async fn trigger(&self, pipeline: &Pipeline) -> Result<()> {
        let provider = self.providers.get(&pipeline.spec.source_code_type)?;
        let config = provider
            .fetch_pipeline_config(pipeline, "")
            .await
            .context("could not fetch pipeline config for cron trigger")?;

        let trigger = TriggerContext {
            trigger_type: TriggerType::Cron,
            triggered_by: "cron".to_string(),
            branch: config.source_branch().unwrap_or_default().to_string(),
            event: "cron".to_string(),
            ..Default::default()
        };
        let execution = PipelineExecution::new(pipeline, config, trigger);
        self.repository.create_execution(&execution).await?;
        info!(
            namespace = pipeline.meta.namespace,
            pipeline = pipeline.meta.name,
            run = execution.spec.run,
            "Created cron triggered execution"
        );
        Ok(())
    }
}

/// Compute the next fire time after `now` for a standard 5-field cron
/// expression. `* * * * *` is rejected outright: a pipeline firing every
/// minute is a configuration error, not a schedule. Unknown timezones fall
/// back to the controller's local zone.
pub fn next_start_time(
    expression: &str,
    timezone: &str,
    now: DateTime<Local>,
) -> Result<DateTime<Local>> {
    let expression = expression.trim();
    if expression == "* * * * *" {
        bail!("cron expression '{expression}' fires too frequently");
    }

    // The schedule parser wants a seconds field; users write standard 5-field
    // expressions.
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    let schedule = cron::Schedule::from_str(&normalized)
        .with_context(|| format!("could not parse cron expression '{expression}'"))?;

    match resolve_timezone(timezone) {
        Some(tz) => schedule
            .after(&now.with_timezone(&tz))
            .next()
            .map(|next| next.with_timezone(&Local))
            .with_context(|| format!("cron expression '{expression}' has no future occurrence")),
        None => schedule
            .after(&now)
            .next()
            .with_context(|| format!("cron expression '{expression}' has no future occurrence")),
    }
}

/// `None` means the controller's local timezone.
fn resolve_timezone(name: &str) -> Option<chrono_tz::Tz> {
    match name {
        "" | "Local" => None,
        other => match other.parse::<chrono_tz::Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!(timezone = other, "Unknown timezone; falling back to local time");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::NoopDeployer;
    use crate::lifecycle::Lifecycle;
    use crate::models::pipeline::PipelineSpec;
    use crate::models::{Finish, State};
    use crate::provider::{Registry, StaticProvider};
    use crate::testutil::{harness, sample_config, StubEngine};
    use chrono::{Duration as ChronoDuration, TimeZone, Timelike};
    use pretty_assertions::assert_eq;

    fn cron_pipeline(expression: &str) -> Pipeline {
        Pipeline::new(
            "p-demo",
            "nightly",
            PipelineSpec {
                project_name: "c-local:p-demo".to_string(),
                repository_url: "https://example.com/demo/web.git".to_string(),
                source_code_type: "static".to_string(),
                trigger_cron_expression: expression.to_string(),
                ..Default::default()
            },
        )
    }

    fn syncer(repository: Arc<crate::repository::memory::MemoryRepository>) -> CronSyncer {
        let providers =
            Registry::new().register("static", Arc::new(StaticProvider::new(sample_config())));
        CronSyncer::new(repository, providers, Duration::from_secs(60), true)
    }

    #[test]
    fn every_minute_expression_is_rejected() {
        let err = next_start_time("* * * * *", "", Local::now()).unwrap_err();
        assert!(err.to_string().contains("too frequently"));
    }

    #[test]
    fn five_field_expressions_are_accepted() {
        let now = Local.with_ymd_and_hms(2026, 8, 7, 10, 0, 0).unwrap();
        let next = next_start_time("30 2 * * *", "", now).unwrap();
        assert!(next > now);
        assert_eq!(next.hour(), 2);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn named_timezone_shifts_the_fire_time() {
        let now = Local.with_ymd_and_hms(2026, 8, 7, 0, 0, 0).unwrap();
        let next = next_start_time("0 12 * * *", "America/New_York", now).unwrap();
        let in_tz = next.with_timezone(&chrono_tz::America::New_York);
        assert_eq!(in_tz.hour(), 12);
    }

    #[test]
    fn unknown_timezone_falls_back_to_local() {
        let now = Local.with_ymd_and_hms(2026, 8, 7, 10, 0, 0).unwrap();
        let next = next_start_time("0 12 * * *", "Not/AZone", now).unwrap();
        assert_eq!(next.hour(), 12);
    }

    #[tokio::test]
    async fn first_tick_only_computes_the_schedule() {
        let (repository, _bus) = harness();
        repository.insert_pipeline(&cron_pipeline("30 2 * * *")).unwrap();

        syncer(repository.clone()).sync_once().await.unwrap();

        let pipeline = repository.get_pipeline("p-demo", "nightly").await.unwrap();
        assert!(!pipeline.status.next_start.is_empty());
        let executions = repository
            .list_executions(Some("p-demo"), &Selector::new())
            .await
            .unwrap();
        assert!(executions.is_empty(), "the first tick must not fire");
    }

    #[tokio::test]
    async fn fires_once_when_on_time() {
        let (repository, _bus) = harness();
        let mut pipeline = cron_pipeline("30 2 * * *");
        pipeline.status.next_start = (Local::now() - ChronoDuration::seconds(10))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        repository.insert_pipeline(&pipeline).unwrap();

        let syncer = syncer(repository.clone());
        syncer.sync_once().await.unwrap();

        let executions = repository
            .list_executions(Some("p-demo"), &Selector::new())
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        let execution = &executions[0];
        assert_eq!(execution.spec.run, 0);
        assert_eq!(execution.spec.trigger_type, TriggerType::Cron);
        assert_eq!(execution.finish(), Finish::Queued);

        let stored = repository.get_pipeline("p-demo", "nightly").await.unwrap();
        let next = DateTime::parse_from_rfc3339(&stored.status.next_start).unwrap();
        assert!(next.with_timezone(&Local) > Local::now());

        // The same occurrence never fires twice.
        syncer.sync_once().await.unwrap();
        let executions = repository
            .list_executions(Some("p-demo"), &Selector::new())
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn stale_next_start_resets_without_firing() {
        let (repository, _bus) = harness();
        let mut pipeline = cron_pipeline("30 2 * * *");
        pipeline.status.next_start = (Local::now() - ChronoDuration::minutes(10))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        repository.insert_pipeline(&pipeline).unwrap();

        syncer(repository.clone()).sync_once().await.unwrap();

        let stored = repository.get_pipeline("p-demo", "nightly").await.unwrap();
        assert!(stored.status.next_start.is_empty(), "stale schedule must reset");
        let executions = repository
            .list_executions(Some("p-demo"), &Selector::new())
            .await
            .unwrap();
        assert!(executions.is_empty(), "missed fires are never replayed");
    }

    #[tokio::test]
    async fn unparseable_next_start_heals_itself() {
        let (repository, _bus) = harness();
        let mut pipeline = cron_pipeline("30 2 * * *");
        pipeline.status.next_start = "not-a-timestamp".to_string();
        repository.insert_pipeline(&pipeline).unwrap();

        syncer(repository.clone()).sync_once().await.unwrap();

        let stored = repository.get_pipeline("p-demo", "nightly").await.unwrap();
        assert!(stored.status.next_start.is_empty());
    }

    /// Scenario: a pipeline with `next_run = 0` fires on schedule; the created
    /// execution carries run 0 and the lifecycle bookkeeping advances the
    /// pipeline to run 1.
    #[tokio::test]
    async fn cron_fire_flows_into_lifecycle_bookkeeping() {
        let (repository, _bus) = harness();
        let mut pipeline = cron_pipeline("30 2 * * *");
        pipeline.status.next_start = (Local::now() - ChronoDuration::seconds(5))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        repository.insert_pipeline(&pipeline).unwrap();

        syncer(repository.clone()).sync_once().await.unwrap();

        let execution = repository
            .get_execution("p-demo", "nightly-0")
            .await
            .unwrap();
        let lifecycle = Lifecycle::new(
            repository.clone(),
            Arc::new(StubEngine::default()),
            Arc::new(NoopDeployer),
        );
        lifecycle.reconcile(&execution).await.unwrap();

        let stored = repository.get_pipeline("p-demo", "nightly").await.unwrap();
        assert_eq!(stored.status.next_run, 1);
        assert_eq!(stored.status.last_execution_id, "p-demo:nightly-0");
        assert_eq!(stored.status.last_run_state, Some(State::Waiting));

        let admitted = repository
            .get_execution("p-demo", "nightly-0")
            .await
            .unwrap();
        assert_eq!(admitted.finish(), Finish::Running);
    }

    #[tokio::test]
    async fn disabled_syncer_does_nothing() {
        let (repository, _bus) = harness();
        let mut pipeline = cron_pipeline("30 2 * * *");
        pipeline.status.next_start = (Local::now() - ChronoDuration::seconds(5))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        repository.insert_pipeline(&pipeline).unwrap();

        let providers =
            Registry::new().register("static", Arc::new(StaticProvider::new(sample_config())));
        let disabled = CronSyncer::new(repository.clone(), providers, Duration::from_secs(60), false);
        disabled.sync_once().await.unwrap();

        let executions = repository
            .list_executions(Some("p-demo"), &Selector::new())
            .await
            .unwrap();
        assert!(executions.is_empty());
    }
}
