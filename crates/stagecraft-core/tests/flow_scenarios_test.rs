//! End-to-end flow scenarios from spec §8, driven through the full
//! `Factory` -> `Endpoint` -> `Stage` -> `Initiator` wiring against
//! `stagecraft-testkit`'s in-memory broker and serializer. These tests
//! do not touch the database side of BE-1PC (see `be_1pc_test.rs` for
//! that) — they exercise trace routing, stack depth, and property
//! propagation end to end.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use stagecraft_core::{Factory, FactoryConfig, StageConfig, TypedStageContext};
use stagecraft_testkit::{FakeDbSupplier, InMemoryBrokerFactory, JsonSerializer};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Payload {
    number: i64,
    string: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct InitState {
    tag: String,
}

fn test_config() -> StageConfig {
    StageConfig::builder().concurrency(1).poll_timeout(Duration::from_millis(20)).build()
}

fn test_factory() -> Factory<JsonSerializer> {
    let broker = InMemoryBrokerFactory::new();
    Factory::new(JsonSerializer, Arc::new(broker), Arc::new(FakeDbSupplier::new()), FactoryConfig::default())
}

/// Scenario 1: Initiator `i0` sends `{number:42,string:"A"}` (no
/// reply-to) to Terminator `T`. `T` observes the data exactly, with no
/// frame left on the stack and no reply produced.
#[tokio::test]
async fn simple_send_delivers_the_payload_unchanged() {
    let factory = test_factory();
    let (tx, mut rx) = mpsc::channel(1);

    factory
        .terminator::<Payload, (), _>("T", test_config(), move |ctx: &mut TypedStageContext<'_, JsonSerializer>, incoming, _state| {
            assert!(ctx.trace().is_terminal_call(), "a SEND-originated call leaves no frame behind");
            let tx = tx.clone();
            async move {
                let _ = tx.send(incoming).await;
                Ok(())
            }
            .boxed()
        })
        .await;

    factory.start().await;

    let initiator = factory.initiator("i0");
    initiator
        .initiate(move |ctx| ctx.send("t1", "T", &Payload { number: 42, string: "A".into() }))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("terminator should receive within the timeout")
        .expect("sender half must stay open");
    assert_eq!(received, Payload { number: 42, string: "A".into() });

    factory.stop().await;
}

/// Scenario 2: Initiator sends to single-stage service `S` (doubles
/// number, appends `:S`) with `replyTo=T` and an initial state. `T`
/// observes the doubled/appended data and the state verbatim.
#[tokio::test]
async fn single_request_reply_doubles_and_returns_state_verbatim() {
    let factory = test_factory();

    factory
        .single::<Payload, (), Payload, _>("S", test_config(), move |_ctx, incoming: Payload, _state: ()| {
            async move {
                Ok(Some(Payload {
                    number: incoming.number * 2,
                    string: format!("{}:S", incoming.string),
                }))
            }
            .boxed()
        })
        .await;

    let (tx, mut rx) = mpsc::channel(1);
    factory
        .terminator::<Payload, InitState, _>("T", test_config(), move |_ctx, incoming, state| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((incoming, state)).await;
                Ok(())
            }
            .boxed()
        })
        .await;

    factory.start().await;

    let initiator = factory.initiator("i0");
    initiator
        .initiate(move |ctx| {
            ctx.request(
                "t1",
                "S",
                &Payload { number: 42, string: "A".into() },
                "T",
                &InitState { tag: "orig".into() },
            )
        })
        .await
        .unwrap();

    let (data, state) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("terminator should receive the reply")
        .expect("sender half must stay open");

    assert_eq!(data, Payload { number: 84, string: "A:S".into() });
    assert_eq!(state, InitState { tag: "orig".into() });

    factory.stop().await;
}

/// Scenario 3: three-level stack. `Leaf` (x2, append `:L`); `Mid` (2
/// stages: first requests `Leaf`, last x3 append `:M`); `Master` (3
/// stages: request `Mid`, request `Leaf`, reply x5 append `:Ma`).
/// Initiate with `{42,"A"}` to `Master`, replyTo `T`. Expect at `T`:
/// `{2520, "A:L:M:L:Ma"}` and the original initiator state verbatim.
#[tokio::test]
async fn three_level_stack_threads_through_leaf_mid_and_master() {
    let factory = test_factory();

    factory
        .single::<Payload, (), Payload, _>("Leaf", test_config(), move |_ctx, incoming: Payload, _state: ()| {
            async move {
                Ok(Some(Payload {
                    number: incoming.number * 2,
                    string: format!("{}:L", incoming.string),
                }))
            }
            .boxed()
        })
        .await;

    let mid = factory
        .staged("Mid")
        .stage::<Payload, (), _>(test_config(), move |ctx, incoming: Payload, _state: ()| {
            async move { ctx.request("Leaf", &incoming, &(), "") }.boxed()
        })
        .last_stage::<Payload, (), Payload, _>(test_config(), move |_ctx, incoming: Payload, _state: ()| {
            async move {
                Ok(Some(Payload {
                    number: incoming.number * 3,
                    string: format!("{}:M", incoming.string),
                }))
            }
            .boxed()
        });
    factory.register(mid).await;

    let master = factory
        .staged("Master")
        .stage::<Payload, (), _>(test_config(), move |ctx, incoming: Payload, _state: ()| {
            async move { ctx.request("Mid", &incoming, &(), "") }.boxed()
        })
        .stage::<Payload, (), _>(test_config(), move |ctx, incoming: Payload, _state: ()| {
            async move { ctx.request("Leaf", &incoming, &(), "") }.boxed()
        })
        .last_stage::<Payload, (), Payload, _>(test_config(), move |_ctx, incoming: Payload, _state: ()| {
            async move {
                Ok(Some(Payload {
                    number: incoming.number * 5,
                    string: format!("{}:Ma", incoming.string),
                }))
            }
            .boxed()
        });
    factory.register(master).await;

    let (tx, mut rx) = mpsc::channel(1);
    factory
        .terminator::<Payload, InitState, _>("T", test_config(), move |_ctx, incoming, state| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((incoming, state)).await;
                Ok(())
            }
            .boxed()
        })
        .await;

    factory.start().await;

    let initiator = factory.initiator("i0");
    initiator
        .initiate(move |ctx| {
            ctx.request(
                "t1",
                "Master",
                &Payload { number: 42, string: "A".into() },
                "T",
                &InitState { tag: "orig".into() },
            )
        })
        .await
        .unwrap();

    let (data, state) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("terminator should receive the final reply")
        .expect("sender half must stay open");

    assert_eq!(
        data,
        Payload {
            number: 42 * 2 * 3 * 2 * 5,
            string: "A:L:M:L:Ma".into(),
        }
    );
    assert_eq!(state, InitState { tag: "orig".into() });

    factory.stop().await;
}

/// Scenario 6: stage `A` sets property `user=alice`; a stage four hops
/// deep reads it; the terminator at the end of the flow still sees it.
#[tokio::test]
async fn trace_property_propagates_to_every_later_hop() {
    let factory = test_factory();

    let (depth4_tx, mut depth4_rx) = mpsc::channel(1);

    let chain = factory
        .staged("Chain")
        .stage::<Payload, (), _>(test_config(), move |ctx, incoming: Payload, _state: ()| {
            async move {
                ctx.set_property("user", &"alice".to_string())?;
                ctx.next(&incoming, &(), "")
            }
            .boxed()
        })
        .stage::<Payload, (), _>(test_config(), move |ctx, incoming: Payload, _state: ()| async move { ctx.next(&incoming, &(), "") }.boxed())
        .stage::<Payload, (), _>(test_config(), move |ctx, incoming: Payload, _state: ()| async move { ctx.next(&incoming, &(), "") }.boxed())
        .last_stage::<Payload, (), Payload, _>(test_config(), move |ctx, incoming: Payload, _state: ()| {
            let depth4_tx = depth4_tx.clone();
            async move {
                let seen: Option<String> = ctx.get_property("user")?;
                let _ = depth4_tx.send(seen).await;
                Ok(Some(incoming))
            }
            .boxed()
        });
    factory.register(chain).await;

    let (term_tx, mut term_rx) = mpsc::channel(1);
    factory
        .terminator::<Payload, InitState, _>("T", test_config(), move |ctx, incoming, state| {
            let term_tx = term_tx.clone();
            async move {
                let seen: Option<String> = ctx.get_property("user")?;
                let _ = term_tx.send((incoming, state, seen)).await;
                Ok(())
            }
            .boxed()
        })
        .await;

    factory.start().await;

    let initiator = factory.initiator("i0");
    initiator
        .initiate(move |ctx| {
            ctx.request(
                "t1",
                "Chain",
                &Payload { number: 1, string: "x".into() },
                "T",
                &InitState { tag: "orig".into() },
            )
        })
        .await
        .unwrap();

    let seen_at_depth4 = tokio::time::timeout(Duration::from_secs(3), depth4_rx.recv())
        .await
        .expect("depth-4 stage should run")
        .expect("sender half must stay open");
    assert_eq!(seen_at_depth4, Some("alice".to_string()));

    let (_, _, seen_at_terminator) = tokio::time::timeout(Duration::from_secs(3), term_rx.recv())
        .await
        .expect("terminator should run")
        .expect("sender half must stay open");
    assert_eq!(seen_at_terminator, Some("alice".to_string()));

    factory.stop().await;
}
