// SPDX-License-Identifier: CEPL-1.0
//! Per-renderer frame synchronisation and the acquire/submit/present steps.
//!
//! STRICT PER-FRAME ORDER:
//! 1) wait in-flight fence (previous frame on this triplet is done)
//! 2) acquire_next_image (signals image-available)
//! 3) update uniforms, reset in-flight fence, queue_submit
//!    (waits image-available, signals render-finished + in-flight)
//! 4) queue_present (waits render-finished)
//!
//! The fence is reset immediately before the submit that re-signals it, so a
//! skipped frame or a failed uniform write leaves it signalled and the next
//! wait cannot deadlock.
use anyhow::{Context, Result};
use ash::vk;
use tracing::debug;

use crate::device::GraphicsDevice;
use crate::error::{RenderError, VkResultExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Submitted,
    Presented,
}

impl FrameState {
    pub fn can_advance_to(self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (Idle | Presented, Acquiring)
                | (Acquiring, Submitted)
                // Skipped frame (out-of-date twice, or a zero extent after recreate).
                | (Acquiring, Idle)
                | (Submitted, Presented)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Image index to render into; `suboptimal` frames are still drawn.
    Ready { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Out-of-date or suboptimal: the chain should be rebuilt before the next frame.
    NeedsRecreate,
}

/// How a frame that did not fail ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { recreated: bool },
    /// Nothing was submitted; the fence is still signalled.
    Skipped { recreated: bool },
}

/// The device-facing steps of one frame. `VkRenderer` implements this over
/// its swapchain and sync objects.
pub(crate) trait FrameOps {
    fn wait_previous(&mut self) -> Result<()>;
    fn acquire_image(&mut self) -> Result<AcquireOutcome>;
    /// Full rebuild at the current target. `false` when the surface has a
    /// zero extent and drawing is paused.
    fn rebuild_chain(&mut self) -> Result<bool>;
    fn write_uniforms(&mut self, index: u32) -> Result<()>;
    fn reset_fence(&mut self) -> Result<()>;
    fn submit_image(&mut self, index: u32) -> Result<()>;
    fn present_image(&mut self, index: u32) -> Result<PresentOutcome>;
}

/// Drives [`FrameOps`] through one frame and owns the recovery policy:
///
/// - out-of-date acquire: rebuild, retry once, skip the frame if still stale
/// - suboptimal acquire: draw anyway
/// - out-of-date or suboptimal present: rebuild after presenting
///
/// Any error poisons the scheduler. The swapchain or the sync objects may be
/// half-updated at that point, so every later frame fails with
/// [`RenderError::Poisoned`] without touching the device.
#[derive(Debug)]
pub struct FrameScheduler {
    state: FrameState,
    poisoned: bool,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self {
            state: FrameState::Idle,
            poisoned: false,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    pub(crate) fn ensure_usable(&self) -> Result<(), RenderError> {
        if self.poisoned {
            Err(RenderError::Poisoned)
        } else {
            Ok(())
        }
    }

    pub(crate) fn run(&mut self, ops: &mut impl FrameOps) -> Result<FrameOutcome> {
        self.ensure_usable()?;
        let res = self.step(ops);
        if res.is_err() {
            self.poisoned = true;
        }
        res
    }

    fn step(&mut self, ops: &mut impl FrameOps) -> Result<FrameOutcome> {
        ops.wait_previous()?;
        self.advance(FrameState::Acquiring);

        let mut recreated = false;
        let mut outcome = ops.acquire_image()?;
        if outcome == AcquireOutcome::OutOfDate {
            debug!("acquire: out of date, recreating");
            recreated = true;
            if !ops.rebuild_chain()? {
                self.advance(FrameState::Idle);
                return Ok(FrameOutcome::Skipped { recreated });
            }
            outcome = ops.acquire_image()?;
        }
        let index = match outcome {
            AcquireOutcome::Ready { index, suboptimal } => {
                if suboptimal {
                    debug!("acquire: suboptimal, drawing anyway");
                }
                index
            }
            AcquireOutcome::OutOfDate => {
                debug!("acquire: still out of date after recreate, skipping frame");
                self.advance(FrameState::Idle);
                return Ok(FrameOutcome::Skipped { recreated });
            }
        };

        ops.write_uniforms(index)?;
        ops.reset_fence()?;
        ops.submit_image(index)?;
        self.advance(FrameState::Submitted);

        let presented = ops.present_image(index)?;
        self.advance(FrameState::Presented);
        if presented == PresentOutcome::NeedsRecreate {
            debug!("present: out of date or suboptimal, recreating");
            ops.rebuild_chain()?;
            recreated = true;
        }
        Ok(FrameOutcome::Presented { recreated })
    }

    fn advance(&mut self, next: FrameState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "frame state {:?} -> {next:?}",
            self.state
        );
        self.state = next;
    }
}

/// Image-available + render-finished semaphores and the in-flight fence.
/// One set per renderer, reused every frame.
pub struct SyncTriplet {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl SyncTriplet {
    /// The fence starts signalled so the first frame does not block.
    pub fn create(device: &GraphicsDevice) -> Result<Self> {
        let d = device.logical();
        let sem_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
        };
        let res = (|| -> Result<(), RenderError> {
            unsafe {
                sync.image_available =
                    d.create_semaphore(&sem_info, None).vk_call("vkCreateSemaphore")?;
                sync.render_finished =
                    d.create_semaphore(&sem_info, None).vk_call("vkCreateSemaphore")?;
                sync.in_flight = d.create_fence(&fence_info, None).vk_call("vkCreateFence")?;
            }
            Ok(())
        })();
        if let Err(e) = res {
            sync.destroy(device);
            return Err(e.into());
        }
        Ok(sync)
    }

    pub fn wait_in_flight(&self, device: &GraphicsDevice) -> Result<()> {
        unsafe {
            device
                .logical()
                .wait_for_fences(std::slice::from_ref(&self.in_flight), true, u64::MAX)
        }
        .vk_call("vkWaitForFences")
        .context("wait_for_fences(in-flight)")?;
        Ok(())
    }

    pub fn reset_in_flight(&self, device: &GraphicsDevice) -> Result<()> {
        unsafe {
            device
                .logical()
                .reset_fences(std::slice::from_ref(&self.in_flight))
        }
        .vk_call("vkResetFences")?;
        Ok(())
    }

    pub fn in_flight_signaled(&self, device: &GraphicsDevice) -> Result<bool> {
        let signaled = unsafe { device.logical().get_fence_status(self.in_flight) }
            .vk_call("vkGetFenceStatus")?;
        Ok(signaled)
    }

    /// Device must be idle. Null handles are skipped.
    pub fn destroy(&mut self, device: &GraphicsDevice) {
        let d = device.logical();
        unsafe {
            if self.in_flight != vk::Fence::null() {
                d.destroy_fence(self.in_flight, None);
            }
            if self.render_finished != vk::Semaphore::null() {
                d.destroy_semaphore(self.render_finished, None);
            }
            if self.image_available != vk::Semaphore::null() {
                d.destroy_semaphore(self.image_available, None);
            }
        }
        self.in_flight = vk::Fence::null();
        self.render_finished = vk::Semaphore::null();
        self.image_available = vk::Semaphore::null();
    }
}

/// Step 2. Out-of-date is an outcome, every other failure is an error.
pub fn acquire(
    device: &GraphicsDevice,
    swapchain: vk::SwapchainKHR,
    sync: &SyncTriplet,
) -> Result<AcquireOutcome> {
    let res = unsafe {
        device.swapchain_loader().acquire_next_image(
            swapchain,
            u64::MAX,
            sync.image_available,
            vk::Fence::null(),
        )
    };
    match res {
        Ok((index, suboptimal)) => Ok(AcquireOutcome::Ready { index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(result) => Err(RenderError::Vulkan {
            call: "vkAcquireNextImageKHR",
            result,
        }
        .into()),
    }
}

/// Step 3: submit the pre-recorded buffer for the acquired image.
pub fn submit(device: &GraphicsDevice, cmd: vk::CommandBuffer, sync: &SyncTriplet) -> Result<()> {
    let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
    let info = vk::SubmitInfo {
        s_type: vk::StructureType::SUBMIT_INFO,
        wait_semaphore_count: 1,
        p_wait_semaphores: &sync.image_available,
        p_wait_dst_stage_mask: wait_stages.as_ptr(),
        command_buffer_count: 1,
        p_command_buffers: &cmd,
        signal_semaphore_count: 1,
        p_signal_semaphores: &sync.render_finished,
        ..Default::default()
    };
    unsafe {
        device.logical().queue_submit(
            device.graphics_queue(),
            std::slice::from_ref(&info),
            sync.in_flight,
        )
    }
    .vk_call("vkQueueSubmit")
    .context("queue_submit")?;
    Ok(())
}

/// Step 4.
pub fn present(
    device: &GraphicsDevice,
    swapchain: vk::SwapchainKHR,
    index: u32,
    sync: &SyncTriplet,
) -> Result<PresentOutcome> {
    let info = vk::PresentInfoKHR {
        s_type: vk::StructureType::PRESENT_INFO_KHR,
        wait_semaphore_count: 1,
        p_wait_semaphores: &sync.render_finished,
        swapchain_count: 1,
        p_swapchains: &swapchain,
        p_image_indices: &index,
        ..Default::default()
    };
    let res = unsafe {
        device
            .swapchain_loader()
            .queue_present(device.present_queue(), &info)
    };
    match res {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::NeedsRecreate),
        Err(result) => Err(RenderError::Vulkan {
            call: "vkQueuePresentKHR",
            result,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::FrameState::*;
    use super::*;

    #[test]
    fn normal_cycle() {
        let cycle = [Idle, Acquiring, Submitted, Presented, Acquiring];
        for w in cycle.windows(2) {
            assert!(w[0].can_advance_to(w[1]), "{:?} -> {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn skipped_frame_returns_to_idle() {
        assert!(Acquiring.can_advance_to(Idle));
        assert!(Idle.can_advance_to(Acquiring));
    }

    /// Scripted device: replays acquire/present results and logs each step.
    #[derive(Default)]
    struct Script {
        acquires: Vec<AcquireOutcome>,
        presents: Vec<PresentOutcome>,
        rebuild_paused: bool,
        fail_uniforms: bool,
        log: Vec<&'static str>,
    }

    impl Script {
        fn acquiring(acquires: &[AcquireOutcome]) -> Self {
            Self {
                acquires: acquires.iter().rev().copied().collect(),
                ..Self::default()
            }
        }

        fn count(&self, step: &str) -> usize {
            self.log.iter().filter(|s| **s == step).count()
        }

        fn position(&self, step: &str) -> Option<usize> {
            self.log.iter().position(|s| *s == step)
        }
    }

    impl FrameOps for Script {
        fn wait_previous(&mut self) -> Result<()> {
            self.log.push("wait");
            Ok(())
        }

        fn acquire_image(&mut self) -> Result<AcquireOutcome> {
            self.log.push("acquire");
            self.acquires.pop().context("script ran out of acquires")
        }

        fn rebuild_chain(&mut self) -> Result<bool> {
            self.log.push("rebuild");
            Ok(!self.rebuild_paused)
        }

        fn write_uniforms(&mut self, _index: u32) -> Result<()> {
            self.log.push("uniforms");
            if self.fail_uniforms {
                anyhow::bail!("vkMapMemory failed");
            }
            Ok(())
        }

        fn reset_fence(&mut self) -> Result<()> {
            self.log.push("reset");
            Ok(())
        }

        fn submit_image(&mut self, _index: u32) -> Result<()> {
            self.log.push("submit");
            Ok(())
        }

        fn present_image(&mut self, _index: u32) -> Result<PresentOutcome> {
            self.log.push("present");
            Ok(self.presents.pop().unwrap_or(PresentOutcome::Presented))
        }
    }

    const READY: AcquireOutcome = AcquireOutcome::Ready {
        index: 1,
        suboptimal: false,
    };

    #[test]
    fn plain_frame_resets_fence_just_before_submit() {
        let mut ops = Script::acquiring(&[READY]);
        let mut sched = FrameScheduler::new();
        let out = sched.run(&mut ops).unwrap();

        assert_eq!(out, FrameOutcome::Presented { recreated: false });
        assert_eq!(sched.state(), Presented);
        assert_eq!(
            ops.log,
            ["wait", "acquire", "uniforms", "reset", "submit", "present"]
        );
    }

    #[test]
    fn out_of_date_acquire_rebuilds_and_retries_once() {
        let mut ops = Script::acquiring(&[AcquireOutcome::OutOfDate, READY]);
        let mut sched = FrameScheduler::new();
        let out = sched.run(&mut ops).unwrap();

        assert_eq!(out, FrameOutcome::Presented { recreated: true });
        assert_eq!(ops.count("acquire"), 2);
        assert_eq!(ops.count("rebuild"), 1);
        assert!(ops.position("rebuild") < ops.position("reset"));
        assert_eq!(sched.state(), Presented);
    }

    #[test]
    fn second_out_of_date_skips_without_touching_fence() {
        let mut ops = Script::acquiring(&[AcquireOutcome::OutOfDate, AcquireOutcome::OutOfDate]);
        let mut sched = FrameScheduler::new();
        let out = sched.run(&mut ops).unwrap();

        assert_eq!(out, FrameOutcome::Skipped { recreated: true });
        assert_eq!(sched.state(), Idle);
        assert_eq!(ops.count("reset"), 0);
        assert_eq!(ops.count("submit"), 0);

        // The next frame proceeds normally.
        ops.acquires.push(READY);
        assert_eq!(
            sched.run(&mut ops).unwrap(),
            FrameOutcome::Presented { recreated: false }
        );
    }

    #[test]
    fn rebuild_to_zero_extent_skips_frame() {
        let mut ops = Script {
            rebuild_paused: true,
            ..Script::acquiring(&[AcquireOutcome::OutOfDate])
        };
        let mut sched = FrameScheduler::new();
        let out = sched.run(&mut ops).unwrap();

        assert_eq!(out, FrameOutcome::Skipped { recreated: true });
        assert_eq!(ops.count("acquire"), 1);
        assert_eq!(ops.count("reset"), 0);
        assert_eq!(sched.state(), Idle);
    }

    #[test]
    fn suboptimal_acquire_still_draws() {
        let mut ops = Script::acquiring(&[AcquireOutcome::Ready {
            index: 0,
            suboptimal: true,
        }]);
        let mut sched = FrameScheduler::new();
        let out = sched.run(&mut ops).unwrap();

        assert_eq!(out, FrameOutcome::Presented { recreated: false });
        assert_eq!(ops.count("submit"), 1);
        assert_eq!(ops.count("rebuild"), 0);
    }

    #[test]
    fn stale_present_rebuilds_after_presenting() {
        let mut ops = Script {
            presents: vec![PresentOutcome::NeedsRecreate],
            ..Script::acquiring(&[READY])
        };
        let mut sched = FrameScheduler::new();
        let out = sched.run(&mut ops).unwrap();

        assert_eq!(out, FrameOutcome::Presented { recreated: true });
        assert_eq!(ops.log.last(), Some(&"rebuild"));
        assert!(ops.position("present") < ops.position("rebuild"));
        assert_eq!(sched.state(), Presented);
    }

    #[test]
    fn failed_uniform_write_keeps_fence_and_poisons() {
        let mut ops = Script {
            fail_uniforms: true,
            ..Script::acquiring(&[READY, READY])
        };
        let mut sched = FrameScheduler::new();
        assert!(sched.run(&mut ops).is_err());
        assert_eq!(ops.count("reset"), 0, "fence must stay signalled");
        assert!(sched.is_poisoned());

        // The next frame refuses before waiting on anything.
        ops.log.clear();
        let err = sched.run(&mut ops).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::Poisoned)
        ));
        assert!(ops.log.is_empty());
    }

    #[test]
    fn no_shortcuts() {
        assert!(!Idle.can_advance_to(Submitted));
        assert!(!Idle.can_advance_to(Presented));
        assert!(!Acquiring.can_advance_to(Presented));
        assert!(!Submitted.can_advance_to(Acquiring));
        assert!(!Presented.can_advance_to(Submitted));
    }
}
