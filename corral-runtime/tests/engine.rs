//! End-to-end engine scenarios against the in-memory state backend.

use async_trait::async_trait;
use corral_core::{
    labels::{Expression, Selector},
    state::{
        mem::MemState, wait::conditions, wait::watch_for, CreateOptions, DestroyOptions,
        GetOptions, ListOptions, State, TeardownOptions, UpdateOptions,
    },
    DynamicResource, Kind, Metadata, Phase, Pointer, ResourceSpec, TypedResource,
};
use corral_runtime::{
    metrics, Controller, Engine, Error, FullRuntime, Input, InputKind, Output, OutputKind,
    QController, QRuntime, QSettings, QTransformController, RuntimeOptions, Transformer,
};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct IntSpec {
    value: i64,
}

impl ResourceSpec for IntSpec {
    const TYPE: &'static str = "IntegerResource";
    const NAMESPACE: &'static str = "default";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct StrSpec {
    value: String,
}

impl ResourceSpec for StrSpec {
    const TYPE: &'static str = "StringResource";
    const NAMESPACE: &'static str = "default";
}

struct Harness {
    cancel: CancellationToken,
    run: tokio::task::JoinHandle<corral_runtime::Result<()>>,
}

impl Harness {
    async fn start(engine: Engine) -> Self {
        let engine = Arc::new(engine);
        let cancel = CancellationToken::new();
        let run = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(cancel).await })
        };
        Self { cancel, run }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.run.await.expect("engine task panicked").expect("engine failed");
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn int_resource(namespace: &str, id: &str, value: i64) -> DynamicResource {
    TypedResource::<IntSpec>::new_in(namespace, id, IntSpec { value })
        .into_dynamic()
        .expect("int spec serializes")
}

async fn create_int(state: &MemState, namespace: &str, id: &str, value: i64) {
    state
        .create(int_resource(namespace, id, value), CreateOptions::default())
        .await
        .expect("create int");
}

async fn int_value(state: &MemState, namespace: &str, id: &str) -> Option<i64> {
    let ptr = Pointer::new(namespace, IntSpec::TYPE, id);
    match state.get(&ptr, GetOptions::default()).await {
        Ok(res) => Some(res.parse::<IntSpec>().expect("int spec").spec.value),
        Err(_) => None,
    }
}

async fn str_value(state: &MemState, namespace: &str, id: &str) -> Option<String> {
    let ptr = Pointer::new(namespace, StrSpec::TYPE, id);
    match state.get(&ptr, GetOptions::default()).await {
        Ok(res) => Some(res.parse::<StrSpec>().expect("str spec").spec.value),
        Err(_) => None,
    }
}

async fn update_int(state: &MemState, namespace: &str, id: &str, value: i64) {
    let ptr = Pointer::new(namespace, IntSpec::TYPE, id);
    loop {
        let current = state.get(&ptr, GetOptions::default()).await.expect("get int");
        let mut typed = current.parse::<IntSpec>().expect("int spec");
        typed.spec.value = value;
        match state
            .update(typed.into_dynamic().expect("serialize"), UpdateOptions::default())
            .await
        {
            Ok(_) => return,
            // A controller may have bumped the version in between.
            Err(err) if err.is_conflict() => continue,
            Err(err) => panic!("update int: {err}"),
        }
    }
}

/// Scenario: strong input, exclusive output, finalizer-gated teardown.
struct IntToStr;

impl IntToStr {
    const NAME: &'static str = "int-to-str";
    const SRC: &'static str = "ns-src";
    const DST: &'static str = "ns-dst";
}

#[async_trait]
impl Controller for IntToStr {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::named(Self::SRC, IntSpec::TYPE, InputKind::Strong)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::named(StrSpec::TYPE, OutputKind::Exclusive)]
    }

    async fn run(&self, rt: &FullRuntime) -> corral_runtime::Result<()> {
        loop {
            rt.next_event().await;
            let ints = rt
                .list_in::<IntSpec>(Self::SRC, ListOptions::default())
                .await?;
            for int in ints {
                let ptr = int.pointer();
                if int.metadata.phase == Phase::Running {
                    if !int.metadata.has_finalizer(Self::NAME) {
                        rt.add_finalizers(&ptr, &[Self::NAME]).await?;
                    }
                    let rendered = int.spec.value.to_string();
                    let template = TypedResource::<StrSpec>::new_in(
                        Self::DST,
                        &*int.metadata.id,
                        StrSpec::default(),
                    );
                    rt.modify(template, |out| {
                        out.spec.value = rendered.clone();
                        Ok(())
                    })
                    .await?;
                } else {
                    let out_ptr = Pointer::new(Self::DST, StrSpec::TYPE, &*int.metadata.id);
                    match rt.teardown(&out_ptr).await {
                        Ok(true) => {
                            rt.destroy(&out_ptr).await?;
                            rt.remove_finalizers(&ptr, &[Self::NAME]).await?;
                        }
                        Ok(false) => {}
                        Err(err) if err.is_not_found() => {
                            rt.remove_finalizers(&ptr, &[Self::NAME]).await?;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn int_to_str_fan_out() {
    let state = MemState::new();
    let engine = Engine::new(Arc::new(state.clone()), RuntimeOptions::new());
    engine
        .register_controller(Arc::new(IntToStr))
        .await
        .unwrap();
    let harness = Harness::start(engine).await;

    create_int(&state, IntToStr::SRC, "one", 1).await;
    create_int(&state, IntToStr::SRC, "two", 2).await;
    eventually("both strings", || {
        let state = state.clone();
        async move {
            str_value(&state, IntToStr::DST, "one").await.as_deref() == Some("1")
                && str_value(&state, IntToStr::DST, "two").await.as_deref() == Some("2")
        }
    })
    .await;

    update_int(&state, IntToStr::SRC, "one", 11).await;
    eventually("updated string", || {
        let state = state.clone();
        async move { str_value(&state, IntToStr::DST, "one").await.as_deref() == Some("11") }
    })
    .await;

    // Teardown is gated by the controller's finalizer until the string is
    // destroyed.
    let one = Pointer::new(IntToStr::SRC, IntSpec::TYPE, "one");
    let ready = state
        .teardown(&one, TeardownOptions::default())
        .await
        .unwrap();
    assert!(!ready, "input unlocked before its output was destroyed");

    let seen = timeout(
        Duration::from_secs(10),
        watch_for(&state, &one, conditions::destroy_ready()),
    )
    .await
    .expect("input never became destroy-ready")
    .unwrap();
    assert!(seen.is_some());
    assert_eq!(str_value(&state, IntToStr::DST, "one").await, None);

    state.destroy(&one, DestroyOptions::default()).await.unwrap();
    harness.shutdown().await;
}

/// Scenario: weak input with a label query, shared output.
struct Summer;

impl Summer {
    const NAME: &'static str = "summer";
    const SRC: &'static str = "src";
    const DST: &'static str = "dst";

    fn selector() -> Selector {
        Selector::everything()
            .with(Expression::Exists("summable".into()))
            .with(Expression::Equal("app".into(), "app1".into()))
    }
}

#[async_trait]
impl Controller for Summer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::named(Self::SRC, IntSpec::TYPE, InputKind::Weak)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::named(IntSpec::TYPE, OutputKind::Shared)]
    }

    async fn run(&self, rt: &FullRuntime) -> corral_runtime::Result<()> {
        loop {
            rt.next_event().await;
            let ints = rt
                .list_in::<IntSpec>(
                    Self::SRC,
                    ListOptions::default().with_selector(Self::selector()),
                )
                .await?;
            let total: i64 = ints.iter().map(|int| int.spec.value).sum();
            let template =
                TypedResource::<IntSpec>::new_in(Self::DST, "sum", IntSpec::default());
            rt.modify(template, |out| {
                out.spec.value = total;
                Ok(())
            })
            .await?;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sum_controller_with_label_filter() {
    let state = MemState::new();
    let engine = Engine::new(Arc::new(state.clone()), RuntimeOptions::new());
    engine.register_controller(Arc::new(Summer)).await.unwrap();
    let harness = Harness::start(engine).await;

    let mut one = int_resource(Summer::SRC, "one", 1);
    one.metadata.set_label("summable", "true");
    let mut two = int_resource(Summer::SRC, "two", 2);
    two.metadata.set_label("summable", "true").set_label("app", "app1");
    let mut three = int_resource(Summer::SRC, "three", 3);
    three.metadata.set_label("summable", "yep").set_label("app", "app1");
    for res in [one, two, three] {
        state.create(res, CreateOptions::default()).await.unwrap();
    }

    eventually("sum of the labelled ints", || {
        let state = state.clone();
        async move { int_value(&state, Summer::DST, "sum").await == Some(5) }
    })
    .await;
    harness.shutdown().await;
}

/// Scenario: a controller that fails (or panics) on every pass is
/// restarted with backoff, making forward progress each time.
struct Crasher {
    name: &'static str,
    namespace: &'static str,
    attempts: AtomicU64,
    panics: bool,
}

#[async_trait]
impl Controller for Crasher {
    fn name(&self) -> &str {
        self.name
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::named(IntSpec::TYPE, OutputKind::Shared)]
    }

    async fn run(&self, rt: &FullRuntime) -> corral_runtime::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        rt.create(TypedResource::<IntSpec>::new_in(
            self.namespace,
            attempt.to_string(),
            IntSpec {
                value: attempt as i64,
            },
        ))
        .await?;
        if self.panics {
            panic!("intentional panic");
        }
        Err(Error::Other(anyhow::anyhow!("intentional failure")))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_controller_restarts_with_backoff() {
    let state = MemState::new();
    let engine = Engine::new(Arc::new(state.clone()), RuntimeOptions::new());
    engine
        .register_controller(Arc::new(Crasher {
            name: "failer",
            namespace: "failer-ns",
            attempts: AtomicU64::new(0),
            panics: false,
        }))
        .await
        .unwrap();
    engine
        .register_controller(Arc::new(Crasher {
            name: "panicker",
            namespace: "panicker-ns",
            attempts: AtomicU64::new(0),
            panics: true,
        }))
        .await
        .unwrap();
    let harness = Harness::start(engine).await;

    // Each restart creates the next id: "0", "1", ...
    for namespace in ["failer-ns", "panicker-ns"] {
        eventually("restart progression", || {
            let state = state.clone();
            async move {
                int_value(&state, namespace, "0").await == Some(0)
                    && int_value(&state, namespace, "1").await == Some(1)
            }
        })
        .await;
    }
    for name in ["failer", "panicker"] {
        eventually("crash counter", || async {
            metrics::CONTROLLER_CRASHES.with_label_values(&[name]).get() >= 2
        })
        .await;
    }
    harness.shutdown().await;
}

/// Scenario: queued controller with concurrency 1; a slow item holds the
/// single worker until its input is torn down.
struct Sleeper;

impl Sleeper {
    const NAME: &'static str = "sleeper";
    const SRC: &'static str = "sleeper-src";
    const DST: &'static str = "sleeper-dst";
}

#[async_trait]
impl QController for Sleeper {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn settings(&self) -> QSettings {
        QSettings::new(
            vec![Input::named(Self::SRC, IntSpec::TYPE, InputKind::QPrimary)],
            vec![Output::named(IntSpec::TYPE, OutputKind::Shared)],
        )
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &Pointer) -> corral_runtime::Result<()> {
        // The cache drives the teardown context below; the input itself is
        // read uncached so a freshly-created item is never missed.
        let input = match rt.get_uncached::<IntSpec>(ptr).await {
            Ok(input) => input,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        if input.metadata.phase != Phase::Running {
            return Ok(());
        }
        let teardown = rt.context_with_teardown(ptr).await?;
        tokio::select! {
            () = teardown.cancelled() => return Ok(()),
            () = sleep(Duration::from_millis(input.spec.value as u64)) => {}
        }
        rt.modify(
            TypedResource::<IntSpec>::new_in(Self::DST, &*input.metadata.id, IntSpec::default()),
            |out| {
                out.spec.value = input.spec.value;
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    async fn map_input(&self, _rt: &QRuntime, _ptr: &Pointer) -> corral_runtime::Result<Vec<Pointer>> {
        Ok(Vec::new())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_sleeper_holds_the_single_worker() {
    let state = MemState::new();
    let engine = Engine::new(
        Arc::new(state.clone()),
        RuntimeOptions::new().cached_resource(Sleeper::SRC, IntSpec::TYPE),
    );
    engine.register_q_controller(Arc::new(Sleeper)).await.unwrap();
    let harness = Harness::start(engine).await;

    for (id, value) in [("id1", 1), ("id2", 2), ("id3", 3)] {
        create_int(&state, Sleeper::SRC, id, value).await;
    }
    eventually("prompt outputs", || {
        let state = state.clone();
        async move {
            int_value(&state, Sleeper::DST, "id1").await == Some(1)
                && int_value(&state, Sleeper::DST, "id2").await == Some(2)
                && int_value(&state, Sleeper::DST, "id3").await == Some(3)
        }
    })
    .await;

    create_int(&state, Sleeper::SRC, "id10s", 10_000).await;
    sleep(Duration::from_millis(500)).await;
    create_int(&state, Sleeper::SRC, "id4", 4).await;
    create_int(&state, Sleeper::SRC, "id5", 5).await;

    // The single worker is asleep on id10s; id4/id5 must stay queued.
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(int_value(&state, Sleeper::DST, "id4").await, None);
    assert_eq!(int_value(&state, Sleeper::DST, "id5").await, None);

    // Tearing the slow input down aborts its reconcile and frees the
    // worker.
    let slow = Pointer::new(Sleeper::SRC, IntSpec::TYPE, "id10s");
    state.teardown(&slow, TeardownOptions::default()).await.unwrap();
    let appeared = async {
        eventually("queued outputs after teardown", || {
            let state = state.clone();
            async move {
                int_value(&state, Sleeper::DST, "id4").await == Some(4)
                    && int_value(&state, Sleeper::DST, "id5").await == Some(5)
            }
        })
        .await;
    };
    timeout(Duration::from_secs(1), appeared)
        .await
        .expect("outputs did not appear within a second of the teardown");
    harness.shutdown().await;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct SourceSpec {
    value: String,
}

impl ResourceSpec for SourceSpec {
    const TYPE: &'static str = "TransformSource";
    const NAMESPACE: &'static str = "transform-ns";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct TargetSpec {
    value: String,
}

impl ResourceSpec for TargetSpec {
    const TYPE: &'static str = "TransformTarget";
    const NAMESPACE: &'static str = "transform-ns";
}

struct Prefixer;

impl Prefixer {
    const NAME: &'static str = "prefixer";
}

#[async_trait]
impl Transformer for Prefixer {
    type Input = SourceSpec;
    type Output = TargetSpec;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn map_metadata(&self, input: &Metadata) -> Option<Metadata> {
        Some(Metadata::new(
            TargetSpec::NAMESPACE,
            TargetSpec::TYPE,
            format!("transformed-{}", input.id),
        ))
    }

    fn unmap_metadata(&self, output: &Metadata) -> Metadata {
        let id = output
            .id
            .strip_prefix("transformed-")
            .unwrap_or(&output.id);
        Metadata::new(SourceSpec::NAMESPACE, SourceSpec::TYPE, id)
    }

    async fn transform(
        &self,
        _rt: &QRuntime,
        input: &TypedResource<SourceSpec>,
        output: &mut TypedResource<TargetSpec>,
    ) -> corral_runtime::Result<()> {
        if input.spec.value == "destroy-output" {
            return Err(Error::DestroyOutput);
        }
        output.spec.value = format!("value-{}", input.spec.value);
        Ok(())
    }
}

fn source_ptr(id: &str) -> Pointer {
    Pointer::new(SourceSpec::NAMESPACE, SourceSpec::TYPE, id)
}

async fn set_source(state: &MemState, id: &str, value: &str) {
    let ptr = source_ptr(id);
    loop {
        let current = state.get(&ptr, GetOptions::default()).await.expect("source");
        let mut typed = current.parse::<SourceSpec>().expect("source spec");
        typed.spec.value = value.to_string();
        match state
            .update(typed.into_dynamic().expect("serialize"), UpdateOptions::default())
            .await
        {
            Ok(_) => return,
            Err(err) if err.is_conflict() => continue,
            Err(err) => panic!("update source: {err}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn qtransform_destroy_output_waits_for_foreign_finalizers() {
    let state = MemState::new();
    let engine = Engine::new(Arc::new(state.clone()), RuntimeOptions::new());
    engine
        .register_q_controller(Arc::new(QTransformController::new(Prefixer)))
        .await
        .unwrap();
    let harness = Harness::start(engine).await;
    let out_ptr = Pointer::new(TargetSpec::NAMESPACE, TargetSpec::TYPE, "transformed-1");

    state
        .create(
            TypedResource::<SourceSpec>::new(
                "1",
                SourceSpec {
                    value: "first".into(),
                },
            )
            .into_dynamic()
            .unwrap(),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    eventually("transformed output", || {
        let (state, out_ptr) = (state.clone(), out_ptr.clone());
        async move {
            matches!(
                state.get(&out_ptr, GetOptions::default()).await,
                Ok(res) if res.parse::<TargetSpec>().unwrap().spec.value == "value-first"
            )
        }
    })
    .await;

    // A foreign finalizer blocks the requested destruction.
    state.add_finalizers(&out_ptr, &["some-fin"]).await.unwrap();
    set_source(&state, "1", "destroy-output").await;
    eventually("output tearing down", || {
        let (state, out_ptr) = (state.clone(), out_ptr.clone());
        async move {
            matches!(
                state.get(&out_ptr, GetOptions::default()).await,
                Ok(res) if res.metadata.phase == Phase::TearingDown
            )
        }
    })
    .await;

    // Updating the input does not resurrect or replace the pending output.
    set_source(&state, "1", "after").await;
    sleep(Duration::from_millis(300)).await;
    let pending = state.get(&out_ptr, GetOptions::default()).await.unwrap();
    assert_eq!(pending.metadata.phase, Phase::TearingDown);

    // Clearing the finalizer lets the output die and a fresh one appear.
    state.remove_finalizers(&out_ptr, &["some-fin"]).await.unwrap();
    eventually("fresh output from the new spec", || {
        let (state, out_ptr) = (state.clone(), out_ptr.clone());
        async move {
            matches!(
                state.get(&out_ptr, GetOptions::default()).await,
                Ok(res) if res.metadata.phase == Phase::Running
                    && res.parse::<TargetSpec>().unwrap().spec.value == "value-after"
            )
        }
    })
    .await;
    harness.shutdown().await;
}

/// Scenario: output tracking destroys outputs untouched by a pass.
struct Doubler;

impl Doubler {
    const NAME: &'static str = "doubler";
    const SRC: &'static str = "dbl-src";
    const DST: &'static str = "dbl-dst";
}

#[async_trait]
impl Controller for Doubler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::named(Self::SRC, IntSpec::TYPE, InputKind::Weak)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::named(IntSpec::TYPE, OutputKind::Shared)]
    }

    async fn run(&self, rt: &FullRuntime) -> corral_runtime::Result<()> {
        loop {
            rt.next_event().await;
            rt.start_tracking_outputs();
            let ints = rt
                .list_in::<IntSpec>(Self::SRC, ListOptions::default())
                .await?;
            for int in ints {
                if int.metadata.phase != Phase::Running {
                    continue;
                }
                let doubled = int.spec.value * 2;
                rt.modify(
                    TypedResource::<IntSpec>::new_in(
                        Self::DST,
                        &*int.metadata.id,
                        IntSpec::default(),
                    ),
                    |out| {
                        out.spec.value = doubled;
                        Ok(())
                    },
                )
                .await?;
            }
            rt.cleanup_outputs(&[Kind::new(Self::DST, IntSpec::TYPE)]).await?;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn output_tracking_cleans_up_stale_outputs() {
    let state = MemState::new();
    let engine = Engine::new(Arc::new(state.clone()), RuntimeOptions::new());
    engine.register_controller(Arc::new(Doubler)).await.unwrap();
    let harness = Harness::start(engine).await;

    for (id, value) in [("one", 1), ("two", 2), ("three", 3)] {
        create_int(&state, Doubler::SRC, id, value).await;
    }
    eventually("doubled outputs", || {
        let state = state.clone();
        async move {
            int_value(&state, Doubler::DST, "one").await == Some(2)
                && int_value(&state, Doubler::DST, "two").await == Some(4)
                && int_value(&state, Doubler::DST, "three").await == Some(6)
        }
    })
    .await;

    // Removing a source leaves its output untouched on the next pass, so
    // cleanup destroys it.
    let three = Pointer::new(Doubler::SRC, IntSpec::TYPE, "three");
    state.teardown(&three, TeardownOptions::default()).await.unwrap();
    state.destroy(&three, DestroyOptions::default()).await.unwrap();
    eventually("stale output destroyed", || {
        let state = state.clone();
        async move {
            int_value(&state, Doubler::DST, "three").await.is_none()
                && int_value(&state, Doubler::DST, "one").await == Some(2)
        }
    })
    .await;
    harness.shutdown().await;
}

/// Boundary: requeue accounting. A bare requeue is not a crash; a
/// requeue carrying an error is both.
struct Requeuer {
    attempts: AtomicU64,
}

impl Requeuer {
    const NAME: &'static str = "requeuer";
    const SRC: &'static str = "req-src";
}

#[async_trait]
impl QController for Requeuer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn settings(&self) -> QSettings {
        QSettings::new(
            vec![Input::named(Self::SRC, IntSpec::TYPE, InputKind::QPrimary)],
            Vec::new(),
        )
    }

    async fn reconcile(&self, _rt: &QRuntime, _ptr: &Pointer) -> corral_runtime::Result<()> {
        match self.attempts.fetch_add(1, Ordering::SeqCst) {
            0 => Err(Error::requeue_after(Duration::from_millis(10))),
            1 => Err(Error::requeue_error(
                Error::Other(anyhow::anyhow!("intentional")),
                Duration::from_millis(10),
            )),
            _ => Ok(()),
        }
    }

    async fn map_input(&self, _rt: &QRuntime, _ptr: &Pointer) -> corral_runtime::Result<Vec<Pointer>> {
        Ok(Vec::new())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn requeue_accounting() {
    let state = MemState::new();
    let engine = Engine::new(Arc::new(state.clone()), RuntimeOptions::new());
    engine
        .register_q_controller(Arc::new(Requeuer {
            attempts: AtomicU64::new(0),
        }))
        .await
        .unwrap();
    let harness = Harness::start(engine).await;

    create_int(&state, Requeuer::SRC, "item", 1).await;
    eventually("item processed after two requeues", || async {
        metrics::QCONTROLLER_PROCESSED
            .with_label_values(&[Requeuer::NAME])
            .get()
            >= 1
    })
    .await;

    assert_eq!(
        metrics::QCONTROLLER_REQUEUES
            .with_label_values(&[Requeuer::NAME])
            .get(),
        2
    );
    assert_eq!(
        metrics::QCONTROLLER_CRASHES
            .with_label_values(&[Requeuer::NAME])
            .get(),
        1
    );
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dependency_graph_exports_registered_edges() {
    let state = MemState::new();
    let engine = Engine::new(Arc::new(state.clone()), RuntimeOptions::new());
    engine.register_controller(Arc::new(IntToStr)).await.unwrap();
    engine.register_controller(Arc::new(Summer)).await.unwrap();

    let graph = engine.dependency_graph();
    assert!(graph
        .edges
        .iter()
        .any(|edge| edge.controller == IntToStr::NAME && edge.type_name == StrSpec::TYPE));
    assert!(graph
        .edges
        .iter()
        .any(|edge| edge.controller == Summer::NAME && edge.namespace.as_deref() == Some(Summer::SRC)));
}
