//! Named extension points for the build pipeline.
//!
//! Handlers observe or augment the shared [`BuildConfig`] at fixed points of
//! the pipeline. The registry is an explicit instance: it is populated during
//! startup, handed to the orchestrator, and read-only for the duration of a
//! build. Dispatch is synchronous on the caller's thread, in registration
//! order, and fail-fast: the first handler error aborts the fan-out and
//! propagates.

use crate::build::BuildConfig;
use crate::errors::VmforgeResult;
use crate::hypervisor::HypervisorKind;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// The fixed set of extension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    /// After capacity checks, before storage is touched.
    PopulateConfig,
    /// Immediately before storage provisioning.
    SetupHardware,
    /// Image extracted, guest tree about to be prepared.
    PrepareVm,
    /// Guest tree fully prepared.
    PreparedVm,
    /// Collects extra per-hypervisor key/value context.
    HypervisorExtra,
    /// VM defined on the hypervisor, not yet started.
    DefinedVm,
    /// Guest reachable after boot.
    VmBooted,
    /// Postboot script ran and was removed.
    PostbootExecuted,
}

impl HookStage {
    /// Stage identifier as exposed to external tooling.
    pub fn name(&self) -> &'static str {
        match self {
            HookStage::PopulateConfig => "populate_config",
            HookStage::SetupHardware => "setup_hardware",
            HookStage::PrepareVm => "prepare_vm",
            HookStage::PreparedVm => "prepared_vm",
            HookStage::HypervisorExtra => "hypervisor_extra",
            HookStage::DefinedVm => "defined_vm",
            HookStage::VmBooted => "vm_booted",
            HookStage::PostbootExecuted => "postboot_executed",
        }
    }
}

/// Stage-specific arguments passed alongside the shared config.
#[derive(Debug, Clone, Copy)]
pub enum HookArgs<'a> {
    None,
    /// Device handle and mount path of the staged guest tree.
    Storage { device: &'a str, mount_path: &'a str },
    /// Kind of the destination hypervisor.
    Hypervisor { kind: HypervisorKind },
}

/// Value returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookValue {
    Unit,
    /// Key/value context to merge into the build config. Used by
    /// `hypervisor_extra`.
    Extras(BTreeMap<String, String>),
}

pub type HookHandler =
    Box<dyn Fn(&mut BuildConfig, &HookArgs<'_>) -> VmforgeResult<HookValue> + Send + Sync>;

/// Stage name → ordered handler list.
#[derive(Default)]
pub struct HookRegistry {
    handlers: HashMap<HookStage, Vec<HookHandler>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the stage's list. Call order follows registration
    /// order; registering the same handler twice invokes it twice.
    pub fn register<F>(&mut self, stage: HookStage, handler: F)
    where
        F: Fn(&mut BuildConfig, &HookArgs<'_>) -> VmforgeResult<HookValue> + Send + Sync + 'static,
    {
        self.handlers
            .entry(stage)
            .or_default()
            .push(Box::new(handler));
    }

    /// Invoke every handler registered for `stage`, in order, on the calling
    /// thread. Returns the ordered handler results. A stage with no handlers
    /// yields an empty list. The first handler error propagates immediately;
    /// remaining handlers are not invoked.
    pub fn dispatch(
        &self,
        stage: HookStage,
        config: &mut BuildConfig,
        args: &HookArgs<'_>,
    ) -> VmforgeResult<Vec<HookValue>> {
        let Some(handlers) = self.handlers.get(&stage) else {
            return Ok(Vec::new());
        };

        tracing::debug!(stage = stage.name(), handlers = handlers.len(), "Dispatching hook");

        let mut results = Vec::with_capacity(handlers.len());
        for handler in handlers {
            results.push(handler(config, args)?);
        }
        Ok(results)
    }
}
