use std::collections::BTreeSet;
use std::time::Duration;

use fcache::{
    models::{ConsumerState, DomainEvent},
    remote::RemoteStore,
};

mod common;

#[tokio::test]
async fn test_rebuild_writes_only_non_empty_sets() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    common::seed(&ctx.cache, &[(1, &[10, 11]), (2, &[]), (3, &[20])])?;

    let report = ctx.cache.rebuild_friend_cache().await?;

    assert_eq!(report.producer.records, 2);
    assert_eq!(report.producer.skipped_empty, 1);
    assert_eq!(report.consumer.final_state, ConsumerState::Done);
    assert_eq!(report.consumer.flushed_records, 2);

    let sets = ctx.remote.friend_sets();
    assert_eq!(sets.len(), 2);
    assert_eq!(sets.get(&1), Some(&BTreeSet::from([10, 11])));
    assert_eq!(sets.get(&3), Some(&BTreeSet::from([20])));
    assert!(!sets.contains_key(&2));
    Ok(())
}

#[tokio::test]
async fn test_rebuild_matches_source_across_many_pages() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    for owner in 1..=25i64 {
        ctx.cache.source.insert_member(owner)?;
        for friend in 0..(owner % 4) {
            ctx.cache.source.insert_friend(owner, 1000 + friend)?;
        }
    }

    let report = ctx.cache.rebuild_friend_cache().await?;
    assert_eq!(report.producer.pages, 13);
    assert_eq!(report.consumer.failed_records, 0);

    for owner in 1..=25i64 {
        let expected: BTreeSet<i64> = (0..(owner % 4)).map(|f| 1000 + f).collect();
        assert_eq!(ctx.remote.friends_of(owner).await?, expected, "owner {}", owner);
    }
    Ok(())
}

#[tokio::test]
async fn test_rebuild_heals_drift_from_missed_events() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    common::seed(&ctx.cache, &[(1, &[10, 11])])?;

    // Stale members written by an earlier pass or a lost removal.
    ctx.remote.add_friend(1, 99).await?;
    ctx.cache
        .processor
        .handle(DomainEvent::RelationAdded {
            owner_id: 1,
            target_id: 98,
        })
        .await;

    ctx.cache.rebuild_friend_cache().await?;
    assert_eq!(ctx.remote.friends_of(1).await?, BTreeSet::from([10, 11]));

    // An unfriend that never reached the cache is picked up by the next pass.
    ctx.cache.source.delete_friend(1, 11)?;
    ctx.cache.rebuild_friend_cache().await?;
    assert_eq!(ctx.remote.friends_of(1).await?, BTreeSet::from([10]));
    Ok(())
}

#[tokio::test]
async fn test_rebuild_is_idempotent() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    common::seed(&ctx.cache, &[(1, &[2]), (2, &[1, 3]), (3, &[2])])?;

    ctx.cache.rebuild_friend_cache().await?;
    let first = ctx.remote.friend_sets();
    ctx.cache.rebuild_friend_cache().await?;
    assert_eq!(ctx.remote.friend_sets(), first);
    Ok(())
}

#[tokio::test]
async fn test_outage_during_rebuild_counts_failed_records() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    common::seed(&ctx.cache, &[(1, &[10]), (2, &[20])])?;
    ctx.remote.set_available(false);

    let report = ctx.cache.rebuild_friend_cache().await?;
    assert_eq!(report.consumer.final_state, ConsumerState::Done);
    assert_eq!(report.consumer.failed_records, 2);
    assert_eq!(report.consumer.flushed_records, 0);

    ctx.remote.set_available(true);
    let healed = ctx.cache.rebuild_friend_cache().await?;
    assert_eq!(healed.consumer.flushed_records, 2);
    Ok(())
}

#[tokio::test]
async fn test_stopped_rebuild_still_terminates_consumer() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    for owner in 1..=200i64 {
        ctx.cache.source.insert_member(owner)?;
        ctx.cache.source.insert_friend(owner, owner + 1)?;
    }

    let handle = ctx.cache.start_rebuild();
    handle.stop();
    let report = tokio::time::timeout(Duration::from_secs(10), handle.wait()).await??;

    assert_eq!(report.consumer.final_state, ConsumerState::Done);
    assert_eq!(report.consumer.flushed_records, report.producer.records);
    if report.producer.interrupted {
        assert!(report.producer.records < 200);
    }
    Ok(())
}

#[tokio::test]
async fn test_aborted_rebuild_interrupts_consumer() -> anyhow::Result<()> {
    let ctx = common::init_test_context().await?;
    common::seed(&ctx.cache, &[(1, &[10])])?;

    let handle = ctx.cache.start_rebuild();
    handle.abort();
    // Either half may observe cancellation first; neither may hang.
    let waited = tokio::time::timeout(Duration::from_secs(10), handle.wait()).await?;
    if let Ok(report) = waited {
        assert!(matches!(
            report.consumer.final_state,
            ConsumerState::Done | ConsumerState::Interrupted
        ));
    }
    Ok(())
}
