//! Initialization: store check, model defaults, capability probe and
//! force directives.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::core::Phase;
use crate::errors::Result;
use crate::ports::ItemQuery;

/// The initialization phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitializationPhase;

#[async_trait]
impl PhaseExecutor for InitializationPhase {
    fn phase(&self) -> Phase {
        Phase::Initialization
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        ctx.store.health_check().await?;
        let defaults = ctx.router.load_defaults().await?;
        ctx.router.cache().set_probe_timeout(ctx.config.probe_timeout());

        if ctx.config.initialization().refresh_capabilities {
            let reachable = ctx.router.cache().refresh_all().await;
            for id in ctx.router.cache().backend_ids() {
                if !reachable.contains(&id) {
                    warn!(backend = %id, "Backend unreachable during initialization");
                }
            }
            info!(
                execution_id = %ctx.execution_id,
                defaults,
                reachable = reachable.len(),
                "Model capabilities refreshed"
            );
        }

        let mut outcome = PhaseOutcome::default();
        for directive in &ctx.config.force {
            let ids: Vec<String> = match &directive.items {
                Some(ids) => ctx
                    .store
                    .query_items(&ItemQuery::Ids(ids.clone()))
                    .await?
                    .into_iter()
                    .map(|i| i.source_id)
                    .collect(),
                None => ctx
                    .store
                    .query_items(&ItemQuery::All)
                    .await?
                    .into_iter()
                    .map(|i| i.source_id)
                    .collect(),
            };
            if let Some(requested) = &directive.items {
                for missing in requested.iter().filter(|id| !ids.contains(id)) {
                    warn!(item_id = %missing, "Force directive names an unknown item");
                }
            }
            outcome.total += ids.len();
            for id in &ids {
                ctx.tracker.reset(id, &[directive.from]).await?;
            }
            outcome.processed += ids.len();
            info!(from = %directive.from, items = ids.len(), "Force directive applied");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContentItem, ModelPhase, ModelSelector, ProcessingStep};
    use crate::core::item::tests::raw;
    use crate::pipeline::{ForceDirective, PipelineConfig};
    use crate::phases::test_support::{harness, harness_with};
    use crate::ports::Store;
    use crate::testing::default_routing;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unavailable_store_fails_the_phase() {
        let h = harness(vec![]);
        h.store.set_unavailable(true);
        let err = InitializationPhase.execute(&h.ctx).await.unwrap_err();
        assert!(err.is_phase_level());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_not_fatal() {
        let h = harness(vec![]);
        h.backend.set_available(false);
        let outcome = InitializationPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(outcome.failed, 0);
        assert_eq!(h.backend.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_hung_backend_probe_is_bounded() {
        let config = PipelineConfig::default().with_probe_timeout(Duration::from_millis(50));
        let h = harness_with(vec![], config, default_routing("local"));
        h.backend.set_probe_delay(Duration::from_secs(30));

        let outcome = tokio::time::timeout(Duration::from_secs(5), InitializationPhase.execute(&h.ctx))
            .await
            .expect("initialization should not wait for the hung probe")
            .unwrap();
        assert_eq!(outcome.failed, 0);
        assert_eq!(h.ctx.router.cache().probe_timeout(), Duration::from_millis(50));
        assert!(!h
            .ctx
            .router
            .cache()
            .availability(&ModelSelector::new("local", "text-model"), crate::core::Capability::TextGeneration)
            .await
            .is_available());
    }

    #[tokio::test]
    async fn test_loads_persisted_defaults() {
        let h = harness(vec![]);
        h.store
            .put_model_default(ModelPhase::Synthesis, &ModelSelector::new("local", "text-model"))
            .await
            .unwrap();
        InitializationPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(
            h.ctx.router.default_for(ModelPhase::Synthesis),
            Some(ModelSelector::new("local", "text-model"))
        );
    }

    #[tokio::test]
    async fn test_force_directive_resets_from_step() {
        let config = PipelineConfig::default().with_force(ForceDirective {
            from: ProcessingStep::ContentUnderstanding,
            items: Some(vec!["1".into(), "missing".into()]),
        });
        let h = harness_with(vec![], config, default_routing("local"));
        let item = ContentItem::from_raw(raw("1", "alice", 0, None));
        h.store.put_item(&item).await.unwrap();
        for step in ProcessingStep::ALL {
            h.ctx.tracker.mark_complete(&item, step).await.unwrap();
        }

        let outcome = InitializationPhase.execute(&h.ctx).await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.failed, 0);

        let status = h.ctx.tracker.status("1").await.unwrap();
        assert!(status.cached);
        assert!(status.media_analyzed);
        assert!(!status.content_understood);
        assert!(!status.categorized);
    }
}
