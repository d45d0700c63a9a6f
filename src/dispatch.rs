//! Recording, submission and timing of one kernel dispatch.
//!
//! An [`Orchestrator`] walks `Idle -> Recording -> Submitted -> Completed` and may start
//! over from `Completed`. Each submission waits on its own fence without timeout.
//!
//! Every resource step is looked up before recording begins, and the new states are
//! committed only once the submission has completed. An illegal step is refused before
//! anything is recorded and leaves every state as it was.

#![allow(unsafe_op_in_unsafe_fn)]

use derive_more::Display;
use thiserror::Error;
use vulkanalia::prelude::v1_4::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    app::{CommandBuffer, Context, Fence, QUERY_POOL_SIZE},
    format::Extent,
    kernel::{KernelError, Pipeline, Workgroup},
    resource::Tracked,
    state::{ResourceState, StateCell, StateError, Transition},
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("orchestrator is {found}, expected {expected}")]
    Phase { expected: Phase, found: Phase },
    #[error("dispatch grid {shape} exceeds device limit {limit:?}")]
    GridTooLarge { shape: DispatchShape, limit: [u32; 3] },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Vulkan(#[from] vk::ErrorCode),
}

/// Number of workgroups launched along each axis.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{x}x{y}x{z}")]
pub struct DispatchShape {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchShape {
    #[inline]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// The smallest grid of `workgroup`-sized groups covering `extent`.
    pub fn grid(extent: Extent, workgroup: Workgroup) -> Self {
        Self {
            x: extent.width.div_ceil(workgroup.x.max(1)),
            y: extent.height.div_ceil(workgroup.y.max(1)),
            z: 1u32.div_ceil(workgroup.z.max(1)),
        }
    }

    /// Whether every element of `extent` gets an invocation.
    pub fn covers(self, extent: Extent, workgroup: Workgroup) -> bool {
        let reach = |groups: u32, size: u32| groups as u64 * size as u64;
        reach(self.x, workgroup.x) >= extent.width as u64
            && reach(self.y, workgroup.y) >= extent.height as u64
            && reach(self.z, workgroup.z) >= 1
    }

    #[inline]
    pub const fn to_array(self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    fn check_limit(self, limit: [u32; 3]) -> Result<(), DispatchError> {
        match self.to_array().iter().zip(limit).all(|(&n, max)| n <= max) {
            true => Ok(()),
            false => Err(DispatchError::GridTooLarge { shape: self, limit }),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Phase {
    #[default]
    #[display("idle")]
    Idle,
    #[display("recording")]
    Recording,
    #[display("submitted")]
    Submitted,
    #[display("completed")]
    Completed,
}

impl Phase {
    /// Checks that `to` may follow `self`.
    pub fn step(self, to: Phase) -> Result<Phase, DispatchError> {
        let expected = match to {
            Phase::Recording if self == Phase::Completed => Phase::Completed,
            Phase::Recording => Phase::Idle,
            Phase::Submitted => Phase::Recording,
            Phase::Completed => Phase::Submitted,
            Phase::Idle => return Ok(to),
        };
        match self == expected {
            true => Ok(to),
            false => Err(DispatchError::Phase {
                expected,
                found: self,
            }),
        }
    }
}

/// Converts a pair of raw timestamps to milliseconds.
///
/// Only the low `valid_bits` of each value are meaningful; the difference wraps inside
/// that range.
pub fn timestamp_ms(start: u64, end: u64, period: f32, valid_bits: u32) -> f64 {
    let mask = match valid_bits {
        64.. => u64::MAX,
        bits => (1u64 << bits) - 1,
    };
    let ticks = (end & mask).wrapping_sub(start & mask) & mask;
    ticks as f64 * period as f64 / 1e6
}

/// One resource's step, looked up but not yet taken.
#[derive(Debug)]
struct Step<'a> {
    resource: &'a dyn Tracked,
    transition: Transition,
    to: ResourceState,
}

impl Step<'_> {
    fn pending(&self) -> Pending {
        Pending {
            cell: self.resource.state_cell().clone(),
            to: self.to,
        }
    }
}

/// A state to commit once the submission completes.
#[derive(Debug)]
struct Pending {
    cell: StateCell,
    to: ResourceState,
}

impl Pending {
    fn commit(&self) -> Result<(), StateError> {
        let mut state = self.cell.lock().map_err(|_| StateError::Lock)?;
        *state = self.to;
        Ok(())
    }
}

/// Looks up the step of every resource to `to`; fails on the first illegal one.
fn plan<'a>(
    resources: &[&'a dyn Tracked],
    to: ResourceState,
) -> Result<Vec<Step<'a>>, StateError> {
    resources
        .iter()
        .map(|&resource| {
            let transition = resource.plan(to)?;
            Ok(Step {
                resource,
                transition,
                to,
            })
        })
        .collect()
}

/// Records and runs a dispatch on a reusable command buffer.
#[derive(Debug)]
pub struct Orchestrator {
    context: Context,
    cmd: CommandBuffer,
    fence: Option<Fence>,
    phase: Phase,
    timestamps: bool,
    pending: Vec<Pending>,
}

impl Orchestrator {
    /// Allocates the command buffer. GPU timestamps are captured when `timestamps` is set
    /// and the compute queue supports them.
    pub fn new(context: &Context, timestamps: bool) -> Result<Self, DispatchError> {
        let timestamps = match timestamps && context.properties.timestamp_valid_bits == 0 {
            true => {
                log::warn!("compute queue does not support timestamps");
                false
            }
            false => timestamps,
        };
        Ok(Self {
            context: context.clone(),
            cmd: context.allocate_command_buffer()?,
            fence: None,
            phase: Phase::Idle,
            timestamps,
            pending: vec![],
        })
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    unsafe fn record_unsafe(
        &self,
        pipeline: &Pipeline,
        shape: DispatchShape,
        reads: &[Step],
        writes: &[Step],
    ) -> Result<(), DispatchError> {
        let device = &self.context.device;
        let cmd = self.cmd.handle();

        let info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(cmd, &info)?;

        if self.timestamps {
            self.context
                .cmd_reset_query_pool(cmd, 0, QUERY_POOL_SIZE as u32);
        }

        // host and transfer writes must land before the kernel reads
        for step in reads {
            step.resource.cmd_barriers(cmd, &step.transition.before);
            step.resource.cmd_barriers(cmd, &step.transition.after);
        }

        pipeline.cmd_bind(cmd);

        if self.timestamps {
            self.context
                .cmd_write_timestamp(cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE, 0);
        }
        device.cmd_dispatch(cmd, shape.x, shape.y, shape.z);
        if self.timestamps {
            self.context
                .cmd_write_timestamp(cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE, 1);
        }

        // kernel writes must land before any transfer reads them back
        for step in writes {
            step.resource.cmd_barriers(cmd, &step.transition.before);
            step.resource.cmd_barriers(cmd, &step.transition.after);
        }

        device.end_command_buffer(cmd)?;
        Ok(())
    }

    /// Drops pending states and returns to `Idle`; an unsubmitted command buffer is reset.
    fn abort(&mut self, reset: bool) {
        self.pending.clear();
        self.fence = None;
        self.phase = Phase::Idle;
        if !reset {
            return;
        }
        let flags = vk::CommandBufferResetFlags::empty();
        let result = unsafe {
            self.context
                .device
                .reset_command_buffer(self.cmd.handle(), flags)
        };
        if let Err(err) = result {
            log::warn!("failed to reset command buffer: {err}");
        }
    }

    /// Records barrier, bind, dispatch and barrier into the command buffer.
    ///
    /// `reads` move to [`ResourceState::DeviceReadable`] before the dispatch and `writes`
    /// to [`ResourceState::DeviceWritten`] after it. Their states change when [`Self::wait`]
    /// succeeds.
    pub fn record(
        &mut self,
        pipeline: &Pipeline,
        shape: DispatchShape,
        reads: &[&dyn Tracked],
        writes: &[&dyn Tracked],
    ) -> Result<(), DispatchError> {
        shape.check_limit(self.context.properties.limits.max_compute_work_group_count)?;
        let phase = self.phase.step(Phase::Recording)?;

        let reads = plan(reads, ResourceState::DeviceReadable)?;
        let writes = plan(writes, ResourceState::DeviceWritten)?;

        self.phase = phase;
        log::debug!(
            "recording dispatch {shape} ({} read(s), {} write(s))",
            reads.len(),
            writes.len()
        );
        match unsafe { self.record_unsafe(pipeline, shape, &reads, &writes) } {
            Ok(()) => {
                self.pending = reads.iter().chain(&writes).map(Step::pending).collect();
                Ok(())
            }
            Err(err) => {
                self.abort(true);
                Err(err)
            }
        }
    }

    pub fn submit(&mut self) -> Result<(), DispatchError> {
        self.phase = self.phase.step(Phase::Submitted)?;
        let result = self.context.create_fence().and_then(|fence| {
            self.context.submit(&self.cmd, &fence)?;
            Ok(fence)
        });
        match result {
            Ok(fence) => {
                self.fence = Some(fence);
                Ok(())
            }
            Err(err) => {
                self.abort(true);
                Err(err.into())
            }
        }
    }

    /// Blocks until the submission completes, releases its fence and commits the states
    /// of the recorded resources.
    ///
    /// Returns the dispatch duration in milliseconds when timestamps are captured.
    pub fn wait(&mut self) -> Result<Option<f64>, DispatchError> {
        self.phase = self.phase.step(Phase::Completed)?;
        let result = match self.fence.take() {
            Some(fence) => fence.wait(),
            None => Ok(()),
        };
        if let Err(err) = result {
            self.abort(false);
            return Err(err.into());
        }
        for pending in self.pending.drain(..) {
            pending.commit()?;
        }
        if !self.timestamps {
            return Ok(None);
        }

        let [start, end] = self.context.query_timestamps()?;
        let properties = &self.context.properties;
        let ms = timestamp_ms(
            start,
            end,
            properties.timestamp_period,
            properties.timestamp_valid_bits,
        );
        log::info!("dispatch: {ms:.4} ms");
        Ok(Some(ms))
    }

    /// Records, submits and waits.
    pub fn run(
        &mut self,
        pipeline: &Pipeline,
        shape: DispatchShape,
        reads: &[&dyn Tracked],
        writes: &[&dyn Tracked],
    ) -> Result<Option<f64>, DispatchError> {
        self.record(pipeline, shape, reads, writes)?;
        self.submit()?;
        self.wait()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use itertools::Itertools;
    use vulkanalia::prelude::v1_4::*;

    use super::{DispatchError, DispatchShape, Orchestrator, Phase, Step, plan, timestamp_ms};
    use crate::{
        app::try_context,
        format::Extent,
        kernel::{KernelSource, PipelineBuilder, SlotKind, Specialization, Workgroup},
        num::Fill,
        resource::Tracked,
        state::{Barrier, ResourceKind, ResourceState, StateCell, StateError},
        transfer::{create_buffer_target, download_buffer, upload_buffer},
    };

    /// A tracked resource with no device object behind it.
    #[derive(Debug)]
    struct Detached {
        kind: ResourceKind,
        state: StateCell,
    }

    impl Detached {
        fn new(kind: ResourceKind, state: ResourceState) -> Self {
            Self {
                kind,
                state: Arc::new(Mutex::new(state)),
            }
        }
    }

    impl Tracked for Detached {
        fn kind(&self) -> ResourceKind {
            self.kind
        }

        fn state_cell(&self) -> &StateCell {
            &self.state
        }

        unsafe fn cmd_barrier(&self, _cmd: vk::CommandBuffer, _barrier: &Barrier) {}

        fn handle(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_grid() {
        let unit = Workgroup::default();
        assert_eq!(
            DispatchShape::grid(Extent::new(4, 8), unit),
            DispatchShape::new(4, 8, 1)
        );

        // convolution output drives the grid
        let output = Extent::new(4 - 3 + 1, 8 - 3 + 1);
        assert_eq!(output, Extent::new(2, 6));
        assert_eq!(DispatchShape::grid(output, unit), DispatchShape::new(2, 6, 1));

        let shape = DispatchShape::grid(Extent::new(17, 5), Workgroup::new(16, 4, 1));
        assert_eq!(shape, DispatchShape::new(2, 2, 1));
        assert_eq!(shape.to_string(), "2x2x1");

        let shape = DispatchShape::grid(Extent::new(32, 1), Workgroup::new(8, 8, 4));
        assert_eq!(shape, DispatchShape::new(4, 1, 1));
    }

    #[test]
    fn test_covers() {
        let workgroup = Workgroup::new(16, 4, 1);
        let extent = Extent::new(17, 5);
        assert!(DispatchShape::grid(extent, workgroup).covers(extent, workgroup));
        assert!(!DispatchShape::new(1, 2, 1).covers(extent, workgroup));
        assert!(!DispatchShape::new(2, 1, 1).covers(extent, workgroup));
        assert!(!DispatchShape::new(2, 2, 0).covers(extent, workgroup));
    }

    #[test]
    fn test_grid_limit() {
        let limit = [65535, 65535, 65535];
        assert!(DispatchShape::new(65535, 1, 1).check_limit(limit).is_ok());
        assert!(matches!(
            DispatchShape::new(65536, 1, 1).check_limit(limit),
            Err(DispatchError::GridTooLarge { .. })
        ));
    }

    #[test]
    fn test_phase_steps() {
        use Phase::*;

        assert_eq!(Idle.step(Recording).unwrap(), Recording);
        assert_eq!(Recording.step(Submitted).unwrap(), Submitted);
        assert_eq!(Submitted.step(Completed).unwrap(), Completed);
        assert_eq!(Completed.step(Recording).unwrap(), Recording);

        assert!(matches!(
            Idle.step(Submitted),
            Err(DispatchError::Phase {
                expected: Recording,
                found: Idle
            })
        ));
        assert!(matches!(
            Recording.step(Completed),
            Err(DispatchError::Phase {
                expected: Submitted,
                found: Recording
            })
        ));
        assert!(Submitted.step(Recording).is_err());
    }

    #[test]
    fn test_timestamp_ms() {
        assert_eq!(timestamp_ms(1_000, 3_000_000, 1.0, 64), 2.999);
        assert_eq!(timestamp_ms(0, 1_000_000, 2.5, 64), 2.5);

        // the counter wrapped inside 36 valid bits
        let max = (1u64 << 36) - 1;
        assert_eq!(timestamp_ms(max, 999_999, 1.0, 36), 1.0);
        // garbage above the valid bits is ignored
        assert_eq!(timestamp_ms(1 << 40, (1 << 40) + 1_000_000, 1.0, 36), 1.0);
    }

    #[test]
    fn test_submit_before_record() {
        let Some(context) = try_context() else {
            return;
        };
        let mut orchestrator = Orchestrator::new(&context, false).unwrap();
        assert_eq!(orchestrator.phase(), Phase::Idle);
        assert!(matches!(
            orchestrator.submit(),
            Err(DispatchError::Phase {
                expected: Phase::Recording,
                found: Phase::Idle
            })
        ));
        assert!(orchestrator.wait().is_err());
        assert_eq!(orchestrator.phase(), Phase::Idle);
    }

    #[test]
    fn test_illegal_step_leaves_states_untouched() {
        use ResourceState::*;

        let input = Detached::new(ResourceKind::Buffer, HostWritten);
        let filter = Detached::new(ResourceKind::Image, HostReadable);
        let result = plan(&[&input, &filter], DeviceReadable);
        assert!(matches!(
            result,
            Err(StateError::IllegalTransition {
                from: HostReadable,
                to: DeviceReadable,
                ..
            })
        ));
        assert_eq!(input.state().unwrap(), HostWritten);
        assert_eq!(filter.state().unwrap(), HostReadable);
    }

    #[test]
    fn test_states_change_on_commit() {
        use ResourceState::*;

        let input = Detached::new(ResourceKind::Buffer, HostWritten);
        let output = Detached::new(ResourceKind::Image, DeviceReadable);
        let reads = plan(&[&input], DeviceReadable).unwrap();
        let writes = plan(&[&output], DeviceWritten).unwrap();
        assert_eq!(reads[0].transition.before.len(), 1);
        assert_eq!(writes[0].transition.after.len(), 1);

        let pending = reads.iter().chain(&writes).map(Step::pending).collect_vec();
        assert_eq!(input.state().unwrap(), HostWritten);
        assert_eq!(output.state().unwrap(), DeviceReadable);

        pending.iter().for_each(|pending| pending.commit().unwrap());
        assert_eq!(input.state().unwrap(), DeviceReadable);
        assert_eq!(output.state().unwrap(), DeviceWritten);

        // each resource feeds one dispatch
        assert!(plan(&[&input], DeviceReadable).is_err());
        assert!(plan(&[&output], DeviceWritten).is_err());
    }

    #[test]
    fn test_orchestrator_recovers_from_illegal_read() {
        let Some(context) = try_context() else {
            return;
        };
        let assets = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets");
        let kernel = KernelSource::new(assets, "shaders/add/add_float.comp.spv");
        if !kernel.exists() {
            eprintln!("skipping: {} not built", kernel.full_path().display());
            return;
        }

        let extent = Extent::new(32, 1);
        let workgroup = Workgroup::default();
        let code = kernel.load().unwrap();
        let pipeline = PipelineBuilder::new(&context)
            .slots(&[SlotKind::StorageBuffer; 3])
            .specialization(Specialization {
                input: extent,
                filter: extent,
                output: extent,
                workgroup,
            })
            .build(&code)
            .unwrap();

        let data: Vec<f32> = Fill::Sequential.generate(extent.len());
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        let input = upload_buffer(&context, bytes).unwrap();
        let output = create_buffer_target(&context, bytes.len()).unwrap();

        // already read back, so no kernel may consume it
        let stale = upload_buffer(&context, bytes).unwrap();
        download_buffer(&context, &stale, &mut vec![0u8; bytes.len()]).unwrap();

        pipeline
            .binder()
            .bind_buffer(0, &output)
            .unwrap()
            .bind_buffer(1, &input)
            .unwrap()
            .bind_buffer(2, &stale)
            .unwrap()
            .build()
            .unwrap();

        let shape = DispatchShape::grid(extent, workgroup);
        let mut orchestrator = Orchestrator::new(&context, false).unwrap();
        let result = orchestrator.record(&pipeline, shape, &[&input, &stale], &[&output]);
        assert!(matches!(
            result,
            Err(DispatchError::State(StateError::IllegalTransition { .. }))
        ));
        assert_eq!(orchestrator.phase(), Phase::Idle);
        assert_eq!(input.state().unwrap(), ResourceState::HostWritten);
        assert_eq!(output.state().unwrap(), ResourceState::DeviceReadable);

        let filter = upload_buffer(&context, bytes).unwrap();
        pipeline
            .binder()
            .bind_buffer(0, &output)
            .unwrap()
            .bind_buffer(1, &input)
            .unwrap()
            .bind_buffer(2, &filter)
            .unwrap()
            .build()
            .unwrap();

        orchestrator
            .run(&pipeline, shape, &[&input, &filter], &[&output])
            .unwrap();
        assert_eq!(orchestrator.phase(), Phase::Completed);
        assert_eq!(input.state().unwrap(), ResourceState::DeviceReadable);
        assert_eq!(output.state().unwrap(), ResourceState::DeviceWritten);

        let mut result = vec![0f32; extent.len()];
        download_buffer(&context, &output, bytemuck::cast_slice_mut(&mut result)).unwrap();
        let expected = data.iter().map(|x| x * 2.0).collect_vec();
        assert_eq!(result, expected);
    }
}
