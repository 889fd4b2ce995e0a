//! Generic one-input to one-output transform controller
//!
//! Captures the common pattern of projecting one resource kind into
//! another with finalizer choreography: the controller finalizes its
//! input, keeps the mapped output in sync while the input runs, and on
//! input teardown destroys the output before releasing the input.

use crate::{
    controller::{Input, InputKind, Output, QController, QSettings},
    error::{Error, Result},
    queued_runtime::QRuntime,
};
use async_trait::async_trait;
use corral_core::{Metadata, Phase, Pointer, ResourceSpec, TypedResource};
use std::{collections::BTreeSet, sync::Arc};

/// The user-supplied transformation.
#[async_trait]
pub trait Transformer: Send + Sync + 'static {
    /// The primary input kind.
    type Input: ResourceSpec;
    /// The produced output kind; `Default` seeds freshly-created outputs.
    type Output: ResourceSpec + Default;

    /// The controller name; doubles as the finalizer put on inputs.
    fn name(&self) -> &str;

    /// Metadata of the output produced for an input; `None` skips the
    /// input entirely.
    fn map_metadata(&self, input: &Metadata) -> Option<Metadata>;

    /// Metadata of the input an output was produced from; inverse of
    /// [`Transformer::map_metadata`].
    fn unmap_metadata(&self, output: &Metadata) -> Metadata;

    /// Fill the output from the input.
    ///
    /// May return [`Error::SkipReconcile`] (success, no change) or
    /// [`Error::DestroyOutput`] (tear the output down) besides plain
    /// errors and requeues.
    async fn transform(
        &self,
        rt: &QRuntime,
        input: &TypedResource<Self::Input>,
        output: &mut TypedResource<Self::Output>,
    ) -> Result<()>;

    /// Gate for releasing the controller's finalizer on a tearing-down
    /// input; return [`Error::SkipReconcile`] to postpone.
    async fn finalizer_removal(
        &self,
        rt: &QRuntime,
        input: &TypedResource<Self::Input>,
    ) -> Result<()> {
        let _ = (rt, input);
        Ok(())
    }
}

/// A user mapper from an extra-input pointer to the primary inputs it
/// affects.
pub type InputMapper = Arc<dyn Fn(&Pointer) -> Vec<Pointer> + Send + Sync>;

enum TeardownPolicy {
    /// Proceed as if running until only the listed finalizers remain.
    Until(BTreeSet<String>),
    /// Ignore teardown while any of the listed finalizers is present.
    While(BTreeSet<String>),
}

/// A [`QController`] implementing the transform pattern for a
/// [`Transformer`].
pub struct QTransformController<T> {
    transformer: T,
    concurrency: usize,
    extra_inputs: Vec<(Input, InputMapper)>,
    extra_outputs: Vec<Output>,
    teardown_policy: Option<TeardownPolicy>,
}

impl<T: Transformer> QTransformController<T> {
    /// Wrap a transformer with default settings.
    pub fn new(transformer: T) -> Self {
        Self {
            transformer,
            concurrency: 1,
            extra_inputs: Vec::new(),
            extra_outputs: Vec::new(),
            teardown_policy: None,
        }
    }

    /// Set the worker concurrency.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Watch an extra input; events are routed through `mapper` to the
    /// primary inputs they affect.
    #[must_use]
    pub fn with_extra_input(mut self, input: Input, mapper: InputMapper) -> Self {
        self.extra_inputs.push((input, mapper));
        self
    }

    /// Declare an extra output type.
    #[must_use]
    pub fn with_extra_output(mut self, output: Output) -> Self {
        self.extra_outputs.push(output);
        self
    }

    /// Proceed as if the input were running until only the listed
    /// finalizers remain on it. Replaces any previously-set policy; the
    /// two policies are mutually exclusive.
    #[must_use]
    pub fn ignore_teardown_until<I>(mut self, finalizers: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.teardown_policy = Some(TeardownPolicy::Until(
            finalizers.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Ignore the input's teardown while any of the listed finalizers is
    /// present. Replaces any previously-set policy.
    #[must_use]
    pub fn ignore_teardown_while<I>(mut self, finalizers: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.teardown_policy = Some(TeardownPolicy::While(
            finalizers.into_iter().map(Into::into).collect(),
        ));
        self
    }

    fn treat_as_running(&self, input: &Metadata) -> bool {
        if input.phase == Phase::Running {
            return true;
        }
        teardown_overridden(
            self.teardown_policy.as_ref(),
            self.transformer.name(),
            &input.finalizers,
        )
    }

    async fn reconcile_running(
        &self,
        rt: &QRuntime,
        input: &TypedResource<T::Input>,
    ) -> Result<()> {
        let input_ptr = input.pointer();
        let finalizer = self.transformer.name();
        if !input.metadata.has_finalizer(finalizer) {
            rt.add_finalizers(&input_ptr, &[finalizer]).await?;
        }

        let Some(out_md) = self.transformer.map_metadata(&input.metadata) else {
            return Ok(());
        };
        let out_ptr = out_md.pointer();

        // A tearing-down output is never updated: wait for its foreign
        // finalizers to clear, destroy it, and only then produce a fresh
        // one.
        match rt.get_uncached::<T::Output>(&out_ptr).await {
            Ok(existing) if existing.metadata.phase == Phase::TearingDown => {
                if !existing.metadata.finalizers_empty() {
                    return Ok(());
                }
                rt.destroy(&out_ptr).await?;
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        match self.apply_transform(rt, input, &out_md).await {
            Ok(()) => Ok(()),
            Err(Error::SkipReconcile) => Ok(()),
            Err(Error::DestroyOutput) => self.initiate_output_destroy(rt, &out_ptr).await,
            Err(err) if err.is_phase_conflict() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Read-transform-write with create fallback, retrying version
    /// conflicts.
    async fn apply_transform(
        &self,
        rt: &QRuntime,
        input: &TypedResource<T::Input>,
        out_md: &Metadata,
    ) -> Result<()> {
        let out_ptr = out_md.pointer();
        loop {
            let current = match rt.get_uncached::<T::Output>(&out_ptr).await {
                Ok(existing) => Some(existing),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err),
            };
            let fresh = current.is_none();
            let mut output = current.unwrap_or_else(|| TypedResource {
                metadata: out_md.clone(),
                spec: T::Output::default(),
            });
            self.transformer.transform(rt, input, &mut output).await?;
            let result = if fresh {
                rt.create(output).await.map(|_| ())
            } else {
                rt.update(output).await.map(|_| ())
            };
            match result {
                Err(Error::State(corral_core::Error::AlreadyExists(_)))
                | Err(Error::State(corral_core::Error::VersionConflict { .. })) => continue,
                result => return result,
            }
        }
    }

    async fn initiate_output_destroy(&self, rt: &QRuntime, out_ptr: &Pointer) -> Result<()> {
        match rt.teardown(out_ptr).await {
            Ok(true) => rt.destroy(out_ptr).await,
            // Foreign finalizers block destruction; the destroy-ready
            // remap wakes us when they clear.
            Ok(false) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn reconcile_teardown(
        &self,
        rt: &QRuntime,
        input: &TypedResource<T::Input>,
    ) -> Result<()> {
        let input_ptr = input.pointer();
        let finalizer = self.transformer.name();

        match self.transformer.finalizer_removal(rt, input).await {
            Ok(()) => {}
            Err(Error::SkipReconcile) => return Ok(()),
            Err(err) => return Err(err),
        }

        let Some(out_md) = self.transformer.map_metadata(&input.metadata) else {
            return rt.remove_finalizers(&input_ptr, &[finalizer]).await;
        };
        let out_ptr = out_md.pointer();

        match rt.teardown(&out_ptr).await {
            Err(err) if err.is_not_found() => {
                return rt.remove_finalizers(&input_ptr, &[finalizer]).await;
            }
            Err(err) => return Err(err),
            Ok(false) => return Ok(()),
            Ok(true) => {}
        }
        rt.destroy(&out_ptr).await?;
        rt.remove_finalizers(&input_ptr, &[finalizer]).await
    }
}

fn teardown_overridden(
    policy: Option<&TeardownPolicy>,
    own_finalizer: &str,
    finalizers: &[String],
) -> bool {
    match policy {
        // The controller's own finalizer counts as listed, it is present
        // for the whole lifetime of the input.
        Some(TeardownPolicy::Until(listed)) => finalizers
            .iter()
            .any(|f| f != own_finalizer && !listed.contains(f)),
        Some(TeardownPolicy::While(listed)) => finalizers.iter().any(|f| listed.contains(f)),
        None => false,
    }
}

#[async_trait]
impl<T: Transformer> QController for QTransformController<T> {
    fn name(&self) -> &str {
        self.transformer.name()
    }

    fn settings(&self) -> QSettings {
        let mut inputs = vec![
            Input::new::<T::Input>(InputKind::QPrimary),
            // Destroy-ready remap: output events route back to their input.
            Input::new::<T::Output>(InputKind::QMappedDestroyReady),
        ];
        inputs.extend(self.extra_inputs.iter().map(|(input, _)| input.clone()));
        let mut outputs = vec![Output::exclusive::<T::Output>()];
        outputs.extend(self.extra_outputs.iter().cloned());
        QSettings::new(inputs, outputs).with_concurrency(self.concurrency)
    }

    async fn reconcile(&self, rt: &QRuntime, ptr: &Pointer) -> Result<()> {
        let input = match rt.get::<T::Input>(ptr).await {
            Ok(input) => input,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        if self.treat_as_running(&input.metadata) {
            self.reconcile_running(rt, &input).await
        } else {
            self.reconcile_teardown(rt, &input).await
        }
    }

    async fn map_input(&self, rt: &QRuntime, ptr: &Pointer) -> Result<Vec<Pointer>> {
        if ptr.type_name == T::Output::TYPE {
            return match rt.get_uncached::<T::Output>(ptr).await {
                Ok(output) => Ok(vec![self.transformer.unmap_metadata(&output.metadata).pointer()]),
                Err(err) if err.is_not_found() => Ok(Vec::new()),
                Err(err) => Err(err),
            };
        }
        if let Some((_, mapper)) = self.extra_inputs.iter().find(|(input, _)| input.covers(ptr)) {
            return Ok(mapper(ptr));
        }
        Err(Error::UnknownMappedKind {
            controller: self.transformer.name().to_string(),
            kind: ptr.kind(),
        })
    }
}
