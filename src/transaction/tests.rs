use super::*;
use crate::bus::{MockBroker, ScriptedFailure};
use crate::cache::CacheOptimizer;
use crate::hooks::Hooks;
use crate::payload::{Headers, Routing};
use crate::publisher::PublisherSettings;
use crate::test_utils::{cached_publisher, make_data, mock_publisher};
use serde_json::json;
use std::sync::Arc;

fn numbered(n: i64) -> Payload {
    Payload::routed("Order", "update", make_data(json!({"id": n}))).unwrap()
}

fn ids(published: &[Payload]) -> Vec<i64> {
    published
        .iter()
        .filter_map(|p| p.data().get("id").and_then(|v| v.as_i64()))
        .collect()
}

fn publisher_with(settings: PublisherSettings) -> (Arc<MockBroker>, Publisher) {
    let broker = Arc::new(MockBroker::new());
    let publisher = Publisher::new(
        broker.clone(),
        Hooks::new(),
        CacheOptimizer::disabled(),
        settings,
    );
    (broker, publisher)
}

mod buffering {
    use super::*;

    #[tokio::test]
    async fn test_nested_commit_preserves_order() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let root = scope.begin(TransactionOptions::new());
        scope.publish(numbered(1)).await.unwrap();

        let child = scope.begin(TransactionOptions::new());
        scope.publish(numbered(2)).await.unwrap();
        scope.finish(child).await.unwrap();

        scope.publish(numbered(3)).await.unwrap();
        assert_eq!(broker.attempts().await, 0);

        scope.finish(root).await.unwrap();

        assert_eq!(ids(&broker.take_published().await), vec![1, 2, 3]);
        assert_eq!(scope.state(root), Some(TransactionState::Released));
        assert_eq!(scope.current(), None);
    }

    #[tokio::test]
    async fn test_publish_buffers_until_root_finishes() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let root = scope.begin(TransactionOptions::new());

        let outcome = scope.publish(numbered(1)).await.unwrap();

        assert_eq!(outcome, PublishOutcome::Buffered);
        assert_eq!(scope.buffered_len(root), 1);
        assert_eq!(broker.attempts().await, 0);
    }

    #[tokio::test]
    async fn test_publish_without_transaction_delivers() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let outcome = scope.publish(numbered(1)).await.unwrap();

        assert_eq!(outcome, PublishOutcome::Delivered);
        assert_eq!(broker.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_unbuffered_transaction_delivers_immediately() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let tx = scope.begin(TransactionOptions::new().buffered(false));

        let outcome = scope.publish(numbered(1)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Delivered);

        scope.rollback(tx).unwrap();
        assert_eq!(broker.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_buffer_default_from_settings() {
        let (broker, publisher) = publisher_with(PublisherSettings {
            buffer_by_default: false,
            ..PublisherSettings::default()
        });
        let mut scope = publisher.scope();
        scope.begin(TransactionOptions::new());

        scope.publish(numbered(1)).await.unwrap();

        assert_eq!(broker.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_max_buffer_delivers_early() {
        let (broker, publisher) = publisher_with(PublisherSettings {
            max_buffer: Some(2),
            ..PublisherSettings::default()
        });
        let mut scope = publisher.scope();
        let root = scope.begin(TransactionOptions::new());

        scope.publish(numbered(1)).await.unwrap();
        assert_eq!(broker.published_count().await, 0);
        scope.publish(numbered(2)).await.unwrap();
        assert_eq!(broker.published_count().await, 2);
        scope.publish(numbered(3)).await.unwrap();
        assert_eq!(scope.buffered_len(root), 1);

        scope.finish(root).await.unwrap();
        assert_eq!(ids(&broker.take_published().await), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_release_isolates_failures() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let root = scope.begin(TransactionOptions::new());
        for n in 1..=3 {
            scope.publish(numbered(n)).await.unwrap();
        }
        broker.script_failures([ScriptedFailure::Fatal]).await;

        scope.finish(root).await.unwrap();

        assert_eq!(ids(&broker.take_published().await), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_payload_is_never_buffered() {
        let broker = Arc::new(MockBroker::new());
        let hooks = Hooks::new().on_before_publish(|p| {
            if p.data().get("id") == Some(&json!(2)) {
                crate::hooks::HookDecision::Cancel
            } else {
                crate::hooks::HookDecision::Proceed
            }
        });
        let publisher = Publisher::new(
            broker.clone(),
            hooks,
            CacheOptimizer::disabled(),
            PublisherSettings::default(),
        );
        let mut scope = publisher.scope();
        let root = scope.begin(TransactionOptions::new());

        scope.publish(numbered(1)).await.unwrap();
        let outcome = scope.publish(numbered(2)).await.unwrap();
        scope.finish(root).await.unwrap();

        assert_eq!(outcome, PublishOutcome::Cancelled);
        assert_eq!(ids(&broker.take_published().await), vec![1]);
    }
}

mod rollback {
    use super::*;

    #[tokio::test]
    async fn test_rollback_discards_whole_tree() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let root = scope.begin(TransactionOptions::new());
        scope.publish(numbered(1)).await.unwrap();
        let sibling = scope.add_child_transaction(root, TransactionOptions::new()).unwrap();
        scope.add_payload(sibling, numbered(2)).await.unwrap();
        scope.finish(sibling).await.unwrap();

        let child = scope.begin(TransactionOptions::new());
        scope.publish(numbered(3)).await.unwrap();
        scope.rollback(child).unwrap();

        assert_eq!(scope.state(root), Some(TransactionState::RolledBack));
        assert_eq!(scope.state(child), Some(TransactionState::RolledBack));
        assert_eq!(scope.current(), None);

        scope.finish(root).await.unwrap();
        assert_eq!(broker.attempts().await, 0);
    }

    #[tokio::test]
    async fn test_rollback_cascades_into_open_children() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let root = scope.begin(TransactionOptions::new());
        let child = scope.begin(TransactionOptions::new());
        scope.publish(numbered(1)).await.unwrap();

        scope.rollback(root).unwrap();

        assert_eq!(scope.state(child), Some(TransactionState::RolledBack));
        assert_eq!(scope.buffered_len(child), 0);

        // Finishing the orphaned child is a no-op.
        scope.finish(child).await.unwrap();
        assert_eq!(broker.attempts().await, 0);
    }

    #[tokio::test]
    async fn test_add_after_rollback_is_rejected() {
        let (_broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let tx = scope.begin(TransactionOptions::new());
        scope.rollback(tx).unwrap();

        let result = scope.add_payload(tx, numbered(1)).await;

        assert!(matches!(
            result,
            Err(TransactionError::NotOpen {
                state: TransactionState::RolledBack,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_rolled_back_change_is_delivered_on_next_publish() {
        let (broker, publisher) = cached_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let tx = scope.begin(TransactionOptions::new());
        scope.publish(numbered(1)).await.unwrap();
        scope.rollback(tx).unwrap();

        let outcome = scope.publish(numbered(1)).await.unwrap();

        assert_eq!(outcome, PublishOutcome::Delivered);
        assert_eq!(ids(&broker.take_published().await), vec![1]);
    }

    #[tokio::test]
    async fn test_released_change_becomes_comparison_base() {
        let (broker, publisher) = cached_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let tx = scope.begin(TransactionOptions::new());
        scope.publish(numbered(1)).await.unwrap();
        scope.finish(tx).await.unwrap();

        let outcome = scope.publish(numbered(1)).await.unwrap();

        assert_eq!(outcome, PublishOutcome::Suppressed);
        assert_eq!(broker.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_rollback_of_released_transaction_is_ignored() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let tx = scope.begin(TransactionOptions::new());
        scope.publish(numbered(1)).await.unwrap();
        scope.finish(tx).await.unwrap();

        scope.rollback(tx).unwrap();

        assert_eq!(scope.state(tx), Some(TransactionState::Released));
        assert_eq!(broker.published_count().await, 1);
    }
}

mod ordering_keys {
    use super::*;

    #[tokio::test]
    async fn test_transaction_key_applies_to_payloads() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let root = scope.begin(TransactionOptions::new().ordering_key("order-7"));
        scope.publish(numbered(1)).await.unwrap();
        scope.finish(root).await.unwrap();

        assert_eq!(broker.take_published().await[0].ordering_key(), "order-7");
    }

    #[tokio::test]
    async fn test_child_inherits_parent_key() {
        let (_broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let root = scope.begin(TransactionOptions::new().ordering_key("order-7"));
        let child = scope.begin(TransactionOptions::new());
        let own = scope
            .add_child_transaction(root, TransactionOptions::new().ordering_key("own"))
            .unwrap();

        assert_eq!(scope.ordering_key(child), Some("order-7"));
        assert_eq!(scope.ordering_key(own), Some("own"));
    }

    #[tokio::test]
    async fn test_forced_key_wins_over_transaction_key() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let root = scope.begin(TransactionOptions::new().ordering_key("order-7"));
        let forced = Payload::new(
            make_data(json!({"id": 1})),
            Routing::new("Order", "update"),
            Headers::default().with_forced_ordering_key("pinned"),
        )
        .unwrap();

        scope.publish(forced).await.unwrap();
        scope.finish(root).await.unwrap();

        assert_eq!(broker.take_published().await[0].ordering_key(), "pinned");
    }

    #[tokio::test]
    async fn test_payload_key_kept_without_transaction_key() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let root = scope.begin(TransactionOptions::new());
        scope.publish(numbered(1)).await.unwrap();
        scope.finish(root).await.unwrap();

        assert_eq!(broker.take_published().await[0].ordering_key(), "Order");
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_current_moves_back_to_parent() {
        let (_broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let root = scope.begin(TransactionOptions::new());
        let child = scope.begin(TransactionOptions::new());
        assert_eq!(scope.current(), Some(child));

        scope.finish(child).await.unwrap();
        assert_eq!(scope.current(), Some(root));
        assert_eq!(scope.state(child), Some(TransactionState::Released));
    }

    #[tokio::test]
    async fn test_side_child_does_not_move_current() {
        let (_broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let root = scope.begin(TransactionOptions::new());
        scope.add_child_transaction(root, TransactionOptions::new()).unwrap();

        assert_eq!(scope.current(), Some(root));
    }

    #[tokio::test]
    async fn test_root_waits_for_pending_children() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let root = scope.begin(TransactionOptions::new());
        scope.publish(numbered(1)).await.unwrap();
        let side = scope.add_child_transaction(root, TransactionOptions::new()).unwrap();
        scope.add_payload(side, numbered(2)).await.unwrap();

        scope.finish(root).await.unwrap();
        assert_eq!(scope.state(root), Some(TransactionState::Finished));
        assert_eq!(broker.attempts().await, 0);

        scope.finish(side).await.unwrap();
        assert_eq!(ids(&broker.take_published().await), vec![1, 2]);
        assert_eq!(scope.state(root), Some(TransactionState::Released));
    }

    #[tokio::test]
    async fn test_finished_root_accepts_payloads_until_released() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let root = scope.begin(TransactionOptions::new());
        scope.publish(numbered(1)).await.unwrap();
        let side = scope.add_child_transaction(root, TransactionOptions::new()).unwrap();
        scope.add_payload(side, numbered(3)).await.unwrap();
        scope.finish(root).await.unwrap();

        assert_eq!(scope.current(), Some(root));
        let outcome = scope.publish(numbered(2)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Buffered);
        assert_eq!(broker.attempts().await, 0);

        scope.finish(side).await.unwrap();
        assert_eq!(ids(&broker.take_published().await), vec![1, 2, 3]);
        assert_eq!(scope.current(), None);
    }

    #[tokio::test]
    async fn test_finish_twice_is_noop() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let tx = scope.begin(TransactionOptions::new());
        scope.publish(numbered(1)).await.unwrap();

        scope.finish(tx).await.unwrap();
        scope.finish(tx).await.unwrap();

        assert_eq!(broker.attempts().await, 1);
    }

    #[tokio::test]
    async fn test_child_of_finished_parent_is_rejected() {
        let (_broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();
        let root = scope.begin(TransactionOptions::new());
        scope.add_child_transaction(root, TransactionOptions::new()).unwrap();
        scope.finish(root).await.unwrap();

        let result = scope.add_child_transaction(root, TransactionOptions::new());

        assert!(matches!(
            result,
            Err(TransactionError::NotOpen {
                state: TransactionState::Finished,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_publish_routed_through_scope() {
        let (broker, publisher) = mock_publisher(Hooks::new());
        let mut scope = publisher.scope();

        let err = scope
            .publish_routed("Order", make_data(json!({})), " ")
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::Payload(_)));

        scope
            .publish_routed("Order", make_data(json!({"id": 1})), "create")
            .await
            .unwrap();
        assert_eq!(broker.published_count().await, 1);
    }
}
