//! Per-resource synchronization state and the barriers each legal step requires.
//!
//! A resource moves through
//! `Uninitialized -> HostWritten -> DeviceReadable -> DeviceWritten -> HostReadable`
//! with two shortcuts: output targets skip the host write
//! (`Uninitialized -> DeviceReadable`) and a host round trip skips the kernel
//! (`HostWritten -> HostReadable`). Every other step is refused.
//!
//! `DeviceReadable -> DeviceWritten` owns the dependency from kernel writes to transfer
//! reads; readback after a dispatch only adds the layout change and the host side.

use std::sync::{Arc, Mutex};

use derive_more::Display;
use thiserror::Error;
use vulkanalia::prelude::v1_4::*;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("illegal {kind} transition: {from} -> {to}")]
    IllegalTransition {
        kind: ResourceKind,
        from: ResourceState,
        to: ResourceState,
    },
    #[error("failed to lock resource state")]
    Lock,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ResourceState {
    /// Freshly allocated; images are in `UNDEFINED` layout.
    #[default]
    Uninitialized,
    /// Filled from the host through a staging copy.
    HostWritten,
    /// Visible to compute-shader reads and writes; images are in `GENERAL` layout.
    DeviceReadable,
    /// Written by a kernel.
    DeviceWritten,
    /// Copied out to host-visible staging memory.
    HostReadable,
}

/// The lockable state of one resource, shared with whoever commits its next step.
pub type StateCell = Arc<Mutex<ResourceState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ResourceKind {
    #[display("buffer")]
    Buffer,
    #[display("image")]
    Image,
}

/// Which side of a staging pair a barrier applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// The tracked device resource.
    Resource,
    /// The transient host-visible counterpart.
    Staging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub target: Target,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    /// `(old, new)` layouts; `None` for buffers.
    pub layout: Option<(vk::ImageLayout, vk::ImageLayout)>,
}

impl Barrier {
    fn buffer(
        target: Target,
        (src_access, dst_access): (vk::AccessFlags, vk::AccessFlags),
        (src_stage, dst_stage): (vk::PipelineStageFlags, vk::PipelineStageFlags),
    ) -> Self {
        Self {
            target,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
            layout: None,
        }
    }

    fn image(
        target: Target,
        access: (vk::AccessFlags, vk::AccessFlags),
        stage: (vk::PipelineStageFlags, vk::PipelineStageFlags),
        layout: (vk::ImageLayout, vk::ImageLayout),
    ) -> Self {
        Self {
            layout: Some(layout),
            ..Self::buffer(target, access, stage)
        }
    }

    #[inline]
    pub fn old_layout(&self) -> vk::ImageLayout {
        self.layout.map_or(vk::ImageLayout::UNDEFINED, |(old, _)| old)
    }

    #[inline]
    pub fn new_layout(&self) -> vk::ImageLayout {
        self.layout.map_or(vk::ImageLayout::UNDEFINED, |(_, new)| new)
    }
}

/// Barriers recorded around the command that performs a state change.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transition {
    pub before: Vec<Barrier>,
    pub after: Vec<Barrier>,
}

impl Transition {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

/// Looks up the barriers for moving a resource of `kind` from `from` to `to`.
pub fn transition(
    kind: ResourceKind,
    from: ResourceState,
    to: ResourceState,
) -> Result<Transition, StateError> {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};
    use ResourceKind::{Buffer, Image};
    use ResourceState::*;
    use Target::{Resource, Staging};

    let transition = match (kind, from, to) {
        // the destination has no prior readers
        (Buffer, Uninitialized, HostWritten) => Transition::default(),
        (Image, Uninitialized, HostWritten) => Transition {
            before: vec![Barrier::image(
                Resource,
                (A::empty(), A::TRANSFER_WRITE),
                (S::TOP_OF_PIPE, S::TRANSFER),
                (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
            )],
            // kernels both sample and write the image
            after: vec![Barrier::image(
                Resource,
                (A::TRANSFER_WRITE, A::SHADER_READ),
                (S::TRANSFER, S::COMPUTE_SHADER),
                (L::TRANSFER_DST_OPTIMAL, L::GENERAL),
            )],
        },

        (Buffer, Uninitialized, DeviceReadable) => Transition::default(),
        (Image, Uninitialized, DeviceReadable) => Transition {
            before: vec![Barrier::image(
                Resource,
                (A::empty(), A::SHADER_READ | A::SHADER_WRITE),
                (S::TOP_OF_PIPE, S::COMPUTE_SHADER),
                (L::UNDEFINED, L::GENERAL),
            )],
            after: vec![],
        },

        (Buffer, HostWritten, DeviceReadable) => Transition {
            before: vec![Barrier::buffer(
                Resource,
                (A::HOST_WRITE | A::TRANSFER_WRITE, A::SHADER_READ),
                (S::HOST | S::TRANSFER, S::COMPUTE_SHADER),
            )],
            after: vec![],
        },
        (Image, HostWritten, DeviceReadable) => Transition {
            before: vec![Barrier::image(
                Resource,
                (A::HOST_WRITE | A::TRANSFER_WRITE, A::SHADER_READ),
                (S::HOST | S::TRANSFER, S::COMPUTE_SHADER),
                (L::GENERAL, L::GENERAL),
            )],
            after: vec![],
        },

        (Buffer, DeviceReadable, DeviceWritten) => Transition {
            before: vec![],
            after: vec![Barrier::buffer(
                Resource,
                (A::SHADER_WRITE, A::TRANSFER_READ),
                (S::COMPUTE_SHADER, S::TRANSFER),
            )],
        },
        (Image, DeviceReadable, DeviceWritten) => Transition {
            before: vec![],
            after: vec![Barrier::image(
                Resource,
                (A::SHADER_WRITE, A::TRANSFER_READ),
                (S::COMPUTE_SHADER, S::TRANSFER),
                (L::GENERAL, L::GENERAL),
            )],
        },

        (Buffer, DeviceWritten, HostReadable) => Transition {
            before: vec![],
            after: vec![Barrier::buffer(
                Staging,
                (A::TRANSFER_WRITE, A::HOST_READ),
                (S::TRANSFER, S::HOST),
            )],
        },
        (Image, DeviceWritten, HostReadable) => Transition {
            before: vec![
                Barrier::image(
                    Staging,
                    (A::empty(), A::TRANSFER_WRITE),
                    (S::TOP_OF_PIPE, S::TRANSFER),
                    (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
                ),
                // chained after the dispatch's write barrier
                Barrier::image(
                    Resource,
                    (A::empty(), A::TRANSFER_READ),
                    (S::TRANSFER, S::TRANSFER),
                    (L::GENERAL, L::TRANSFER_SRC_OPTIMAL),
                ),
            ],
            after: vec![Barrier::image(
                Staging,
                (A::TRANSFER_WRITE, A::HOST_READ),
                (S::TRANSFER, S::HOST),
                (L::TRANSFER_DST_OPTIMAL, L::GENERAL),
            )],
        },

        (Buffer, HostWritten, HostReadable) => Transition {
            before: vec![Barrier::buffer(
                Resource,
                (A::TRANSFER_WRITE, A::TRANSFER_READ),
                (S::TRANSFER, S::TRANSFER),
            )],
            after: vec![Barrier::buffer(
                Staging,
                (A::TRANSFER_WRITE, A::HOST_READ),
                (S::TRANSFER, S::HOST),
            )],
        },
        (Image, HostWritten, HostReadable) => Transition {
            before: vec![
                Barrier::image(
                    Staging,
                    (A::empty(), A::TRANSFER_WRITE),
                    (S::TOP_OF_PIPE, S::TRANSFER),
                    (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
                ),
                Barrier::image(
                    Resource,
                    (A::TRANSFER_WRITE | A::MEMORY_READ, A::TRANSFER_READ),
                    (S::TRANSFER, S::TRANSFER),
                    (L::GENERAL, L::TRANSFER_SRC_OPTIMAL),
                ),
            ],
            after: vec![Barrier::image(
                Staging,
                (A::TRANSFER_WRITE, A::HOST_READ),
                (S::TRANSFER, S::HOST),
                (L::TRANSFER_DST_OPTIMAL, L::GENERAL),
            )],
        },

        _ => return Err(StateError::IllegalTransition { kind, from, to }),
    };
    Ok(transition)
}

#[cfg(test)]
mod tests {
    use itertools::iproduct;
    use vulkanalia::prelude::v1_4::*;

    use super::{Barrier, ResourceKind, ResourceState, StateError, Target, transition};

    const STATES: [ResourceState; 5] = [
        ResourceState::Uninitialized,
        ResourceState::HostWritten,
        ResourceState::DeviceReadable,
        ResourceState::DeviceWritten,
        ResourceState::HostReadable,
    ];

    #[test]
    fn test_legal_transitions() {
        use ResourceState::*;

        let legal = [
            (Uninitialized, HostWritten),
            (Uninitialized, DeviceReadable),
            (HostWritten, DeviceReadable),
            (DeviceReadable, DeviceWritten),
            (DeviceWritten, HostReadable),
            (HostWritten, HostReadable),
        ];
        for (kind, from, to) in iproduct!(
            [ResourceKind::Buffer, ResourceKind::Image],
            STATES,
            STATES
        ) {
            let result = transition(kind, from, to);
            match legal.contains(&(from, to)) {
                true => assert!(result.is_ok(), "{kind}: {from} -> {to} refused"),
                false => assert!(
                    matches!(result, Err(StateError::IllegalTransition { .. })),
                    "{kind}: {from} -> {to} accepted"
                ),
            }
        }
    }

    #[test]
    fn test_buffer_upload_needs_no_barrier() {
        let t = transition(
            ResourceKind::Buffer,
            ResourceState::Uninitialized,
            ResourceState::HostWritten,
        )
        .unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn test_image_upload_layouts() {
        let t = transition(
            ResourceKind::Image,
            ResourceState::Uninitialized,
            ResourceState::HostWritten,
        )
        .unwrap();
        assert_eq!(t.before.len(), 1);
        assert_eq!(t.before[0].old_layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(t.before[0].new_layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(t.after.len(), 1);
        assert_eq!(t.after[0].old_layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(t.after[0].new_layout(), vk::ImageLayout::GENERAL);
        assert_eq!(t.after[0].dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_buffer_download_barrier_pair() {
        let t = transition(
            ResourceKind::Buffer,
            ResourceState::DeviceWritten,
            ResourceState::HostReadable,
        )
        .unwrap();

        // the dispatch already published the kernel writes
        assert!(t.before.is_empty());

        let [after] = t.after.as_slice() else {
            panic!("expected one barrier after the copy");
        };
        assert_eq!(after.target, Target::Staging);
        assert_eq!(after.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(after.dst_access, vk::AccessFlags::HOST_READ);
        assert_eq!(after.dst_stage, vk::PipelineStageFlags::HOST);
    }

    #[test]
    fn test_image_download_touches_both_sides() {
        let t = transition(
            ResourceKind::Image,
            ResourceState::DeviceWritten,
            ResourceState::HostReadable,
        )
        .unwrap();
        let source = t
            .before
            .iter()
            .find(|b| b.target == Target::Resource)
            .unwrap();
        assert_eq!(source.old_layout(), vk::ImageLayout::GENERAL);
        assert_eq!(source.new_layout(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

        let staging = t
            .before
            .iter()
            .find(|b| b.target == Target::Staging)
            .unwrap();
        assert_eq!(staging.old_layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(staging.new_layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        assert!(t.after.iter().all(|b| b.target == Target::Staging));
        assert_eq!(t.after[0].new_layout(), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn test_dispatch_publishes_kernel_writes() {
        for kind in [ResourceKind::Buffer, ResourceKind::Image] {
            let t = transition(
                kind,
                ResourceState::DeviceReadable,
                ResourceState::DeviceWritten,
            )
            .unwrap();
            assert!(t.before.is_empty());
            assert_eq!(t.after[0].src_access, vk::AccessFlags::SHADER_WRITE);
            assert_eq!(t.after[0].dst_access, vk::AccessFlags::TRANSFER_READ);
            assert_eq!(t.after[0].src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        }
    }

    #[test]
    fn test_kernel_write_barrier_recorded_once() {
        let is_write_to_read = |barrier: &&Barrier| {
            barrier.target == Target::Resource
                && barrier.src_access.contains(vk::AccessFlags::SHADER_WRITE)
                && barrier.dst_access.contains(vk::AccessFlags::TRANSFER_READ)
        };
        for kind in [ResourceKind::Buffer, ResourceKind::Image] {
            let dispatch = transition(
                kind,
                ResourceState::DeviceReadable,
                ResourceState::DeviceWritten,
            )
            .unwrap();
            let readback = transition(
                kind,
                ResourceState::DeviceWritten,
                ResourceState::HostReadable,
            )
            .unwrap();
            let count = [dispatch, readback]
                .iter()
                .flat_map(|t| t.before.iter().chain(&t.after))
                .filter(is_write_to_read)
                .count();
            assert_eq!(count, 1, "{kind}");
        }
    }

    #[test]
    fn test_host_writes_visible_before_dispatch() {
        let t = transition(
            ResourceKind::Buffer,
            ResourceState::HostWritten,
            ResourceState::DeviceReadable,
        )
        .unwrap();
        assert!(t.before[0].src_access.contains(vk::AccessFlags::HOST_WRITE));
        assert_eq!(t.before[0].dst_access, vk::AccessFlags::SHADER_READ);
        assert!(t.after.is_empty());
    }
}
