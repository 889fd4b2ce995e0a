//! A transform controller rendering integers into strings.
//!
//! Run with: `cargo run --example transform`

use corral::core::state::{
    mem::MemState, wait::conditions, wait::watch_for, CreateOptions, State, TeardownOptions,
};
use corral::runtime::{CancellationToken, Engine, QRuntime, Result, RuntimeOptions};
use corral::{Metadata, Pointer, QTransformController, ResourceSpec, Transformer, TypedResource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct IntSpec {
    value: i64,
}

impl ResourceSpec for IntSpec {
    const TYPE: &'static str = "IntegerResource";
    const NAMESPACE: &'static str = "default";
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StrSpec {
    value: String,
}

impl ResourceSpec for StrSpec {
    const TYPE: &'static str = "StringResource";
    const NAMESPACE: &'static str = "default";
}

struct Render;

#[async_trait::async_trait]
impl Transformer for Render {
    type Input = IntSpec;
    type Output = StrSpec;

    fn name(&self) -> &str {
        "render"
    }

    fn map_metadata(&self, input: &Metadata) -> Option<Metadata> {
        Some(Metadata::new(StrSpec::NAMESPACE, StrSpec::TYPE, &*input.id))
    }

    fn unmap_metadata(&self, output: &Metadata) -> Metadata {
        Metadata::new(IntSpec::NAMESPACE, IntSpec::TYPE, &*output.id)
    }

    async fn transform(
        &self,
        _rt: &QRuntime,
        input: &TypedResource<IntSpec>,
        output: &mut TypedResource<StrSpec>,
    ) -> Result<()> {
        output.spec.value = input.spec.value.to_string();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let state = MemState::new();
    let engine = Engine::new(
        Arc::new(state.clone()),
        RuntimeOptions::new().change_rate_limit(100, 200),
    );
    engine
        .register_q_controller(Arc::new(QTransformController::new(Render)))
        .await?;

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        let engine = Arc::new(engine);
        tokio::spawn(async move { engine.run(cancel).await })
    };

    // Create an integer and wait for its rendered string.
    state
        .create(
            TypedResource::new("answer", IntSpec { value: 42 }).into_dynamic()?,
            CreateOptions::default(),
        )
        .await?;
    let rendered = Pointer::of::<StrSpec>("answer");
    let seen = watch_for(&state, &rendered, conditions::exists())
        .await?
        .expect("condition held on an existing resource");
    println!("rendered: {:?}", seen.parse::<StrSpec>()?.spec.value);

    // Tear the input down; the controller destroys the output and then
    // releases its finalizer on the input.
    let input = Pointer::of::<IntSpec>("answer");
    state.teardown(&input, TeardownOptions::default()).await?;
    watch_for(&state, &input, conditions::destroy_ready()).await?;
    watch_for(&state, &rendered, conditions::destroyed()).await?;
    println!("input unlocked, output destroyed");

    cancel.cancel();
    run.await??;
    Ok(())
}
