//! Wires a three-level call stack end to end against the in-memory
//! test doubles and prints the final reply: `Leaf` doubles a number,
//! `Mid` calls `Leaf` once and triples the result, `Master` calls `Mid`
//! then `Leaf` again before quintupling the result. Run with:
//!
//! ```text
//! cargo run --example three_level_stack -p stagecraft-core
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use stagecraft_core::{Factory, FactoryConfig, StageConfig};
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

fn stage_config() -> StageConfig {
    StageConfig::builder().concurrency(2).build()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let broker = InMemoryBrokerFactory::new();
    let factory = Factory::new(JsonSerializer, Arc::new(broker), Arc::new(FakeDbSupplier::new()), FactoryConfig::default());

    factory
        .single::<Payload, (), Payload, _>("Leaf", stage_config(), move |_ctx, incoming: Payload, _state: ()| {
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
        .stage::<Payload, (), _>(stage_config(), move |ctx, incoming: Payload, _state: ()| async move { ctx.request("Leaf", &incoming, &(), "") }.boxed())
        .last_stage::<Payload, (), Payload, _>(stage_config(), move |_ctx, incoming: Payload, _state: ()| {
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
        .stage::<Payload, (), _>(stage_config(), move |ctx, incoming: Payload, _state: ()| async move { ctx.request("Mid", &incoming, &(), "") }.boxed())
        .stage::<Payload, (), _>(stage_config(), move |ctx, incoming: Payload, _state: ()| async move { ctx.request("Leaf", &incoming, &(), "") }.boxed())
        .last_stage::<Payload, (), Payload, _>(stage_config(), move |_ctx, incoming: Payload, _state: ()| {
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
        .terminator::<Payload, InitState, _>("T", stage_config(), move |_ctx, incoming, state| {
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
        .expect("initiate should succeed");

    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some((data, state))) => println!("final reply: {data:?}, state: {state:?}"),
        Ok(None) => eprintln!("terminator channel closed with no reply"),
        Err(_) => eprintln!("timed out waiting for the final reply"),
    }

    factory.stop().await;
}
