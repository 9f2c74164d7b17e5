use std::collections::BTreeSet;

use fcache::{
    dlq::DeadLetterStore,
    models::{ActivityKind, DlqStatus, DomainEvent, EventOutcome, RankingDomain},
    remote::RemoteStore,
    utils::{id::score_event_id, keys::interaction_key},
};

mod common;

fn scored(owner_id: i64, target_id: i64, delta: f64) -> DomainEvent {
    DomainEvent::InteractionScored {
        event_id: score_event_id(),
        owner_id,
        target_id,
        delta,
    }
}

#[tokio::test]
async fn test_outage_dead_letters_exactly_the_failed_increment() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    let processor = &ctx.cache.processor;

    assert_eq!(processor.handle(scored(1, 7, 5.0)).await, EventOutcome::Applied);
    ctx.remote.set_available(false);
    assert_eq!(
        processor.handle(scored(1, 7, 3.0)).await,
        EventOutcome::DeadLettered
    );
    ctx.remote.set_available(true);

    let rows = ctx.cache.dead_letters.list(None, 10)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].score_delta, Some(3.0));
    assert_eq!(rows[0].status, DlqStatus::Pending);
    assert_eq!(rows[0].retry_count, 0);
    assert_eq!(ctx.remote.score(&interaction_key(1), "7").await?, Some(5.0));

    let report = ctx.cache.reconciler.run_once().await?;
    assert_eq!(report.processed, 1);
    assert_eq!(ctx.remote.score(&interaction_key(1), "7").await?, Some(8.0));
    Ok(())
}

#[tokio::test]
async fn test_duplicate_relation_failures_collapse() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    ctx.remote.set_available(false);

    let add = DomainEvent::RelationAdded {
        owner_id: 4,
        target_id: 5,
    };
    ctx.cache.processor.handle(add.clone()).await;
    ctx.cache.processor.handle(add).await;
    ctx.cache
        .processor
        .handle(DomainEvent::RelationRemoved {
            owner_id: 4,
            target_id: 5,
        })
        .await;

    assert_eq!(ctx.cache.dead_letters.count()?, 2);
    assert!(ctx.cache.dead_letters.get_by_event_id("RELATION_ADD:4:5")?.is_some());
    assert!(ctx
        .cache
        .dead_letters
        .get_by_event_id("RELATION_REMOVE:4:5")?
        .is_some());
    Ok(())
}

#[tokio::test]
async fn test_reconciliation_retries_until_store_returns() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    ctx.remote.set_available(false);
    ctx.cache
        .processor
        .handle(DomainEvent::RelationAdded {
            owner_id: 1,
            target_id: 2,
        })
        .await;

    let failed = ctx.cache.reconciler.run_once().await?;
    assert_eq!(failed.failed, 1);
    let row = ctx
        .cache
        .dead_letters
        .get_by_event_id("RELATION_ADD:1:2")?
        .ok_or_else(|| anyhow::anyhow!("row missing"))?;
    assert_eq!(row.status, DlqStatus::Failed);
    assert_eq!(row.retry_count, 1);

    ctx.remote.set_available(true);
    let recovered = ctx.cache.reconciler.run_once().await?;
    assert_eq!(recovered.processed, 1);
    assert_eq!(ctx.remote.friends_of(1).await?, BTreeSet::from([2]));
    assert_eq!(ctx.cache.dead_letters.list(Some(DlqStatus::Processed), 10)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_dispatcher_feeds_rankings_and_friend_sets() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    let dispatcher = ctx.cache.start_dispatcher();

    dispatcher
        .publish(DomainEvent::RelationAdded {
            owner_id: 1,
            target_id: 2,
        })
        .await?;
    for activity in [ActivityKind::View, ActivityKind::Like, ActivityKind::Comment] {
        dispatcher
            .publish(DomainEvent::ContentActivity {
                domain: RankingDomain::PostRealtime,
                entity_id: 11,
                activity,
            })
            .await?;
    }

    let stats = dispatcher.shutdown().await?;
    assert_eq!(stats.received, 4);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.best_effort, 3);

    let ranking = ctx.cache.ranking(RankingDomain::PostRealtime)?;
    assert_eq!(ranking.score(11).await?, Some(6.0));
    assert_eq!(ctx.remote.friends_of(1).await?, BTreeSet::from([2]));
    Ok(())
}

#[tokio::test]
async fn test_trending_view_tracks_decay() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    let ranking = ctx.cache.ranking(RankingDomain::PaperRealtime)?;
    ranking.increment(1, 0.5).await;
    ranking.increment(2, 20.0).await;

    let outcome = ctx.cache.decay(RankingDomain::PaperRealtime).await?;
    assert_eq!(outcome.rescaled, 2);
    assert_eq!(outcome.pruned, 1);

    let view = ctx
        .cache
        .top_view(RankingDomain::PaperRealtime, 5)
        .await?
        .ok_or_else(|| anyhow::anyhow!("view missing"))?;
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.entries[0].entity_id, "2");
    Ok(())
}
