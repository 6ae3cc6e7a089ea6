//! Disk resize driven by caller-supplied callbacks.
//!
//! There is no byte-level notion of progress here: the operation only
//! polls the backend once per `run` call until it reports a final status.

use super::{DiskImageOperation, DiskImageStatus, OperationState, VmId};

/// Status report from the resize backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResizeUpdate {
    pub status: DiskImageStatus,
    pub failure_reason: String,
}

impl ResizeUpdate {
    pub fn in_progress() -> Self {
        Self {
            status: DiskImageStatus::InProgress,
            failure_reason: String::new(),
        }
    }

    pub fn resized() -> Self {
        Self {
            status: DiskImageStatus::Resized,
            failure_reason: String::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: DiskImageStatus::Failed,
            failure_reason: reason.into(),
        }
    }
}

/// Polls the backend for the current state of a resize.
pub type ResizePoll = Box<dyn FnMut(&VmId) -> ResizeUpdate>;

pub struct VmResizeOperation {
    state: OperationState,
    target_size: u64,
    poll: ResizePoll,
}

impl VmResizeOperation {
    /// Start resizing `vm_id` to `size` bytes.
    ///
    /// `start` runs synchronously and decides the initial status, so the
    /// returned operation may already be finished (or failed).
    pub fn create<S>(vm_id: VmId, size: u64, start: S, poll: ResizePoll) -> DiskImageOperation
    where
        S: FnOnce(&VmId, u64) -> ResizeUpdate,
    {
        let mut op = Self {
            state: OperationState::new(vm_id),
            target_size: size,
            poll,
        };

        let update = start(op.state.vm_id(), size);
        op.apply(update);
        tracing::info!(
            uuid = %op.state.uuid(),
            vm = %op.state.vm_id(),
            size,
            status = %op.state.status(),
            "Started disk resize"
        );

        DiskImageOperation::Resize(op)
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    pub fn target_size(&self) -> u64 {
        self.target_size
    }

    /// Poll once; the io budget is irrelevant.
    pub(crate) fn execute_io(&mut self, _io_limit: u64) -> bool {
        let update = (self.poll)(self.state.vm_id());
        self.apply(update);
        self.state.status() != DiskImageStatus::InProgress
    }

    pub(crate) fn finalize(&mut self) {}

    fn apply(&mut self, update: ResizeUpdate) {
        if update.status.is_failure() {
            tracing::warn!(
                uuid = %self.state.uuid(),
                vm = %self.state.vm_id(),
                status = %update.status,
                "Resize failed: {}",
                update.failure_reason
            );
        }
        self.state.set_failure_reason(update.failure_reason);
        self.state.set_status(update.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn vm() -> VmId {
        VmId::new("owner", "termina")
    }

    #[test]
    fn test_start_callback_sets_initial_status() {
        let op = VmResizeOperation::create(
            vm(),
            1 << 30,
            |id, size| {
                assert_eq!(id.name, "termina");
                assert_eq!(size, 1 << 30);
                ResizeUpdate::in_progress()
            },
            Box::new(|_| ResizeUpdate::in_progress()),
        );
        assert_eq!(op.status(), DiskImageStatus::InProgress);
        assert_eq!(op.progress(), 0);
    }

    #[test]
    fn test_polls_until_resized() {
        let polls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&polls);
        let mut op = VmResizeOperation::create(
            vm(),
            4096,
            |_, _| ResizeUpdate::in_progress(),
            Box::new(move |_| {
                counter.set(counter.get() + 1);
                if counter.get() < 3 {
                    ResizeUpdate::in_progress()
                } else {
                    ResizeUpdate::resized()
                }
            }),
        );

        assert_eq!(op.run(0).unwrap(), DiskImageStatus::InProgress);
        assert_eq!(op.run(1).unwrap(), DiskImageStatus::InProgress);
        assert_eq!(op.run(u64::MAX).unwrap(), DiskImageStatus::Resized);
        assert_eq!(polls.get(), 3);
        assert_eq!(op.progress(), 100);
    }

    #[test]
    fn test_poll_failure_is_recorded() {
        let mut op = VmResizeOperation::create(
            vm(),
            4096,
            |_, _| ResizeUpdate::in_progress(),
            Box::new(|_| ResizeUpdate::failed("lvm said no")),
        );

        assert_eq!(op.run(1).unwrap(), DiskImageStatus::Failed);
        assert_eq!(op.failure_reason(), "lvm said no");
    }

    #[test]
    fn test_born_failed_is_never_polled() {
        let polled = Rc::new(Cell::new(false));
        let flag = Rc::clone(&polled);
        let mut op = VmResizeOperation::create(
            vm(),
            4096,
            |_, _| ResizeUpdate::failed("no such disk"),
            Box::new(move |_| {
                flag.set(true);
                ResizeUpdate::resized()
            }),
        );

        assert!(op.run(1).is_err());
        assert!(!polled.get());
        assert_eq!(op.status(), DiskImageStatus::Failed);
    }
}
