//! Outputs, the externally visible side of a pipeline
//!
//! A [`DrmOutput`] translates configuration requests, frames, power state and cursor
//! updates into [`DrmPipeline`] operations. It owns the swapchain frames are rendered
//! into, decides between the hardware cursor plane and compositing the cursor into the
//! frame, and debounces power-off requests.

use std::time::Instant;

use drm::control::{connector, Mode};
use drm_fourcc::DrmFourcc;
use tracing::{debug, info, info_span, instrument, warn};

use super::{
    color::{ColorTransform, GammaRamp},
    device::KmsDevice,
    error::Error,
    framebuffer::{FramebufferId, Framebuffers},
    gpu::KmsObjects,
    pipeline::{ApplyOutcome, CommitKind, CursorState, DrmPipeline, PipelineState},
    swapchain::{RenderTarget, Swapchain},
};
use crate::{
    config::DrmBackendConfig,
    utils::{Logical, Physical, Point, Size, Transform},
};

const CURSOR_SLOTS: usize = 2;

/// Requested configuration of an output
///
/// A disabled configuration wins over everything else it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfiguration {
    /// Whether the output should scan out
    pub enabled: bool,
    /// Mode to use, `None` keeps the current or falls back to the preferred mode
    pub mode: Option<Mode>,
    /// Position in the global compositor space
    pub position: Point<i32, Logical>,
    /// Scale factor
    pub scale: f64,
    /// Output transform
    pub transform: Transform,
    /// Variable refresh rate
    pub vrr: bool,
}

impl Default for OutputConfiguration {
    fn default() -> Self {
        OutputConfiguration {
            enabled: true,
            mode: None,
            position: (0, 0).into(),
            scale: 1.0,
            transform: Transform::Normal,
            vrr: false,
        }
    }
}

/// Display power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DpmsMode {
    /// Powered on
    On,
    /// Standby
    Standby,
    /// Suspended
    Suspend,
    /// Powered off
    Off,
}

impl DpmsMode {
    fn is_on(self) -> bool {
        self == DpmsMode::On
    }
}

/// A mode advertised by the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputMode {
    /// The mode
    pub mode: Mode,
    /// The monitor flags this mode as preferred
    pub preferred: bool,
    /// The output currently uses this mode
    pub current: bool,
}

/// A cursor image in `Argb8888`, rows tightly packed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    /// Size of the image
    pub size: Size<u32, Physical>,
    /// Offset of the pointer location inside the image
    pub hotspot: Point<i32, Physical>,
    /// Pixel format of `pixels`
    pub format: DrmFourcc,
    /// Pixel data
    pub pixels: Vec<u8>,
}

/// Frame storage of an output
///
/// Frames are rendered into a framebuffer acquired with [`OutputLayer::begin_frame`]
/// and shown by [`DrmOutput::present`].
#[derive(Debug)]
pub struct OutputLayer {
    swapchain: Swapchain,
    rendered: Option<FramebufferId>,
}

impl OutputLayer {
    fn new(size: Size<u32, Physical>, slots: usize) -> OutputLayer {
        OutputLayer {
            swapchain: Swapchain::new(size, DrmFourcc::Xrgb8888, slots),
            rendered: None,
        }
    }

    /// Acquire the framebuffer for the next frame
    ///
    /// A frame started earlier but never presented is dropped.
    pub fn begin_frame<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        arena: &mut Framebuffers,
    ) -> Result<RenderTarget, Error> {
        if let Some(stale) = self.rendered.take() {
            self.swapchain.discard(stale);
        }
        let target = self.swapchain.acquire(device, arena)?;
        self.rendered = Some(target.framebuffer);
        Ok(target)
    }

    /// Copy pixel data into a framebuffer of this layer
    ///
    /// Fails with [`Error::BufferBusy`] if the framebuffer is on screen.
    pub fn write_frame<D: KmsDevice + ?Sized>(
        &self,
        device: &D,
        arena: &Framebuffers,
        fb: FramebufferId,
        pixels: &[u8],
    ) -> Result<(), Error> {
        if !self.swapchain.contains(fb) {
            return Err(Error::UnknownFramebuffer);
        }
        let framebuffer = arena.begin_write(fb)?;
        device
            .write_framebuffer(framebuffer.handle, pixels)
            .map_err(super::error::access("Failed to write framebuffer", device.dev_path()))
    }

    /// The swapchain backing this layer
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Framebuffer of the frame in progress
    pub fn rendered(&self) -> Option<FramebufferId> {
        self.rendered
    }
}

/// What a page-flip meant for an output
#[derive(Debug)]
pub struct FlipOutcome {
    /// Kind of the commit that completed
    pub kind: CommitKind,
    /// Result of an apply deferred by the completed commit
    pub deferred_apply: Option<Result<ApplyOutcome, Error>>,
    /// Power state that took effect with the deferred apply
    pub dpms_changed: Option<DpmsMode>,
}

/// A connector driven by a pipeline
#[derive(Debug)]
pub struct DrmOutput {
    name: String,
    physical_size: Option<(u32, u32)>,
    pipeline: DrmPipeline,
    layer: OutputLayer,
    cursor_swapchain: Swapchain,
    hw_cursor: CursorState,
    cursor_position: Point<i32, Physical>,
    cursor_hotspot: Point<i32, Physical>,
    set_cursor_successful: bool,
    move_cursor_successful: bool,
    dpms: DpmsMode,
    requested_dpms: DpmsMode,
    pending_dpms: Option<DpmsMode>,
    turn_off_deadline: Option<Instant>,
    config: DrmBackendConfig,
    span: tracing::Span,
}

impl DrmOutput {
    /// Create an output for a connector, adopting whatever the kernel currently shows
    pub fn new<D: KmsDevice + ?Sized>(
        device: &D,
        kms: &mut KmsObjects,
        connector: connector::Handle,
        config: &DrmBackendConfig,
    ) -> Result<DrmOutput, Error> {
        let pipeline = DrmPipeline::new(device, kms, connector)?;
        let conn = kms.connectors.get(&connector).ok_or(Error::UnknownConnector)?;
        let name = conn.name().to_string();
        let physical_size = conn.physical_size();
        let size = pipeline
            .active_state()
            .mode
            .or_else(|| conn.preferred_mode())
            .map(mode_size)
            .unwrap_or_default();

        let span = info_span!("drm_output", output = %name);
        span.in_scope(|| info!(?physical_size, "output created"));
        Ok(DrmOutput {
            name,
            physical_size,
            pipeline,
            layer: OutputLayer::new(size, config.swapchain_slots),
            cursor_swapchain: Swapchain::new(kms.cursor_size, DrmFourcc::Argb8888, CURSOR_SLOTS),
            hw_cursor: CursorState::hidden(),
            cursor_position: (0, 0).into(),
            cursor_hotspot: (0, 0).into(),
            set_cursor_successful: false,
            move_cursor_successful: true,
            dpms: DpmsMode::On,
            requested_dpms: DpmsMode::On,
            pending_dpms: None,
            turn_off_deadline: None,
            config: config.clone(),
            span,
        })
    }

    /// Name of the output, e.g. `DP-1`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connector driven by this output
    pub fn connector(&self) -> connector::Handle {
        self.pipeline.connector()
    }

    /// Physical size in millimeters
    pub fn physical_size(&self) -> Option<(u32, u32)> {
        self.physical_size
    }

    /// The underlying pipeline
    pub fn pipeline(&self) -> &DrmPipeline {
        &self.pipeline
    }

    /// Layer frames are rendered into
    pub fn output_layer(&mut self) -> &mut OutputLayer {
        &mut self.layer
    }

    /// Mode of the last acknowledged state
    pub fn current_mode(&self) -> Option<Mode> {
        self.pipeline.active_state().mode
    }

    /// Returns true if the output is enabled in the last acknowledged state
    pub fn is_enabled(&self) -> bool {
        self.pipeline.active_state().enabled
    }

    /// Current power state
    ///
    /// A power state change waiting for a page-flip is not reflected until it was
    /// committed.
    pub fn dpms_mode(&self) -> DpmsMode {
        self.dpms
    }

    /// Modes advertised by the connector, flagged as preferred and current
    pub fn modes(&self, kms: &KmsObjects) -> Vec<OutputMode> {
        let Some(conn) = kms.connectors.get(&self.connector()) else {
            return Vec::new();
        };
        let preferred = conn.preferred_mode();
        let current = self.pipeline.next_state().mode;
        conn.modes()
            .iter()
            .map(|mode| OutputMode {
                mode: *mode,
                preferred: preferred.as_ref() == Some(mode),
                current: current.as_ref() == Some(mode),
            })
            .collect()
    }

    /// Validate and queue a configuration
    ///
    /// Nothing is sent to the kernel. On error the queued state is unchanged.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn queue_changes(&mut self, kms: &KmsObjects, config: &OutputConfiguration) -> Result<(), Error> {
        let next = self.pipeline.next_state();
        let mut state = PipelineState {
            active: next.active,
            gamma: next.gamma.clone(),
            ctm: next.ctm,
            ..PipelineState::default()
        };
        if !config.enabled {
            if config.mode.is_some() || config.vrr {
                debug!("output is disabled, ignoring mode and vrr");
            }
            return self.pipeline.queue_changes(kms, state);
        }

        let conn = kms.connectors.get(&self.connector()).ok_or(Error::UnknownConnector)?;
        let mode = config
            .mode
            .or(next.mode)
            .or_else(|| conn.preferred_mode())
            .ok_or(Error::InvalidConfiguration("no mode available"))?;
        state.enabled = true;
        state.mode = Some(mode);
        state.position = config.position;
        state.scale = config.scale;
        state.transform = config.transform;
        state.vrr = config.vrr;
        state.cursor = next.cursor;
        state.primary = next.primary.filter(|fb| {
            kms.framebuffers
                .get(*fb)
                .map(|f| f.size == mode_size(mode))
                .unwrap_or(false)
        });
        self.pipeline.queue_changes(kms, state)
    }

    /// Submit the queued configuration
    ///
    /// A primary framebuffer matching the new mode is allocated if needed. On failure
    /// the previous state, its framebuffers and swapchain stay untouched.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn apply_queued_changes<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
    ) -> Result<ApplyOutcome, Error> {
        let Some(queued) = self.pipeline.queued_state() else {
            return Ok(ApplyOutcome::Unchanged);
        };
        if self.pipeline.is_pending() {
            return self.pipeline.apply(device, kms);
        }

        let previous_primary = queued.primary;
        let mut staging = None;
        let mut staged_fb = None;
        if let (true, Some(mode)) = (queued.is_scanning_out(), queued.mode) {
            let size = mode_size(mode);
            if queued.primary.is_none() {
                let chain = if self.layer.swapchain.size() == size {
                    &mut self.layer.swapchain
                } else {
                    staging.insert(Swapchain::new(
                        size,
                        self.layer.swapchain.format(),
                        self.config.swapchain_slots,
                    ))
                };
                let target = chain.acquire(device, &mut kms.framebuffers)?;
                staged_fb = Some(target.framebuffer);
                if let Some(queued) = self.pipeline.queued_mut() {
                    queued.primary = Some(target.framebuffer);
                }
            }
        }

        match self.pipeline.apply(device, kms) {
            Ok(outcome) => {
                if let Some(mut new_chain) = staging {
                    std::mem::swap(&mut self.layer.swapchain, &mut new_chain);
                    new_chain.release_all(&mut kms.framebuffers);
                    if let Some(rendered) = self.layer.rendered.take() {
                        debug!(?rendered, "dropping frame of the old size");
                    }
                }
                if let Some(fb) = staged_fb {
                    self.layer.swapchain.submitted(fb);
                }
                if !self.pipeline.next_state().enabled {
                    self.layer.rendered = None;
                    self.layer.swapchain.release_all(&mut kms.framebuffers);
                    self.cursor_swapchain.release_all(&mut kms.framebuffers);
                    self.hw_cursor = CursorState::hidden();
                }
                kms.collect_garbage(device);
                Ok(outcome)
            }
            Err(err) => {
                if let Some(queued) = self.pipeline.queued_mut() {
                    queued.primary = previous_primary;
                }
                match (staging, staged_fb) {
                    (Some(mut chain), _) => chain.release_all(&mut kms.framebuffers),
                    (None, Some(fb)) => self.layer.swapchain.discard(fb),
                    _ => {}
                }
                kms.collect_garbage(device);
                Err(err)
            }
        }
    }

    /// Discard the queued configuration
    pub fn revert_queued_changes(&mut self) {
        self.pipeline.revert_queued_changes();
        self.pending_dpms = None;
    }

    /// Enable or disable the output, keeping the rest of its configuration
    pub fn update_enablement<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        enabled: bool,
    ) -> Result<ApplyOutcome, Error> {
        let config = self.configuration_with(|c| c.enabled = enabled);
        self.queue_and_apply(device, kms, &config)
    }

    fn configuration_with(&self, f: impl FnOnce(&mut OutputConfiguration)) -> OutputConfiguration {
        let next = self.pipeline.next_state();
        let mut config = OutputConfiguration {
            enabled: next.enabled,
            mode: next.mode,
            position: next.position,
            scale: next.scale,
            transform: next.transform,
            vrr: next.vrr,
        };
        f(&mut config);
        config
    }

    fn queue_and_apply<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        config: &OutputConfiguration,
    ) -> Result<ApplyOutcome, Error> {
        self.queue_changes(kms, config)?;
        self.apply_queued_changes(device, kms).map_err(|err| {
            self.pipeline.revert_queued_changes();
            err
        })
    }

    fn queue_state_and_apply<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        state: PipelineState,
    ) -> Result<ApplyOutcome, Error> {
        self.pipeline.queue_changes(kms, state)?;
        self.apply_queued_changes(device, kms).map_err(|err| {
            self.pipeline.revert_queued_changes();
            err
        })
    }

    /// React to a changed mode list
    ///
    /// If the mode in use vanished, the closest remaining mode is queued and applied.
    /// Returns whether the mode had to change.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn update_modes<D: KmsDevice + ?Sized>(&mut self, device: &D, kms: &mut KmsObjects) -> Result<bool, Error> {
        let next = self.pipeline.next_state();
        let (true, Some(current)) = (next.enabled, next.mode) else {
            return Ok(false);
        };
        let conn = kms.connectors.get(&self.connector()).ok_or(Error::UnknownConnector)?;
        if conn.supports_mode(&current) {
            return Ok(false);
        }
        let Some(mode) = closest_mode(conn.modes(), &current) else {
            warn!("no modes left, disabling output");
            self.update_enablement(device, kms, false)?;
            return Ok(true);
        };
        info!(old = ?current, new = ?mode, "mode vanished, falling back to closest mode");
        let config = self.configuration_with(|c| c.mode = Some(mode));
        self.queue_and_apply(device, kms, &config)?;
        Ok(true)
    }

    /// Show the rendered frame
    ///
    /// Only the primary framebuffer and the cursor plane change. On failure the frame
    /// is dropped, the caller may render again for the next vblank.
    #[profiling::function]
    pub fn present<D: KmsDevice + ?Sized>(&mut self, device: &D, kms: &mut KmsObjects) -> Result<(), Error> {
        let fb = self.layer.rendered.take().ok_or(Error::NoRenderedFrame)?;
        let cursor = if self.uses_software_cursor() {
            CursorState::hidden()
        } else {
            self.hw_cursor
        };
        match self.pipeline.present(device, kms, fb, cursor) {
            Ok(()) => {
                self.layer.swapchain.submitted(fb);
                Ok(())
            }
            Err(err) => {
                debug!(parent: &self.span, ?err, "dropping frame");
                self.layer.swapchain.discard(fb);
                Err(err)
            }
        }
    }

    /// Request a power state
    ///
    /// Powering on cancels a scheduled power-off and happens immediately. Powering off
    /// is delayed by the configured turn-off delay, see [`DrmOutput::dispatch_timer`].
    /// Returns the new mode if it took effect right away. While a commit is in flight
    /// the change is settled by [`DrmOutput::page_flipped`].
    #[instrument(level = "debug", parent = &self.span, skip(self, device, kms))]
    pub fn set_dpms_mode<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        mode: DpmsMode,
        now: Instant,
    ) -> Result<Option<DpmsMode>, Error> {
        self.requested_dpms = mode;
        if mode.is_on() {
            if self.turn_off_deadline.take().is_some() {
                debug!("power-off cancelled");
            }
            if self.dpms.is_on() && self.pending_dpms.is_none() {
                return Ok(None);
            }
            return self.apply_dpms(device, kms, mode);
        }

        if !self.dpms.is_on() && self.pending_dpms.is_none() {
            self.dpms = mode;
            return Ok(None);
        }
        if self.config.dpms_turn_off_delay.is_zero() {
            return self.apply_dpms(device, kms, mode);
        }
        self.turn_off_deadline
            .get_or_insert(now + self.config.dpms_turn_off_delay);
        Ok(None)
    }

    /// When the scheduled power-off is due
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.turn_off_deadline
    }

    /// Perform a scheduled power-off if it is due
    pub fn dispatch_timer<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        now: Instant,
    ) -> Result<Option<DpmsMode>, Error> {
        match self.turn_off_deadline {
            Some(deadline) if deadline <= now => {
                self.turn_off_deadline = None;
                self.apply_dpms(device, kms, self.requested_dpms)
            }
            _ => Ok(None),
        }
    }

    fn apply_dpms<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        mode: DpmsMode,
    ) -> Result<Option<DpmsMode>, Error> {
        let mut state = self.pipeline.next_state().clone();
        state.active = mode.is_on();
        if self.queue_state_and_apply(device, kms, state)? == ApplyOutcome::Deferred {
            debug!(parent: &self.span, ?mode, "commit in flight, power state change deferred");
            self.pending_dpms = Some(mode);
            return Ok(None);
        }
        self.pending_dpms = None;
        Ok(self.settle_dpms(mode))
    }

    fn settle_dpms(&mut self, mode: DpmsMode) -> Option<DpmsMode> {
        if self.dpms == mode {
            return None;
        }
        info!(parent: &self.span, ?mode, "power state changed");
        self.dpms = mode;
        Some(mode)
    }

    /// Size of the gamma lookup table of the crtc driving this output, zero if unsupported
    pub fn gamma_ramp_size(&self, kms: &KmsObjects) -> usize {
        self.crtc_for_queries(kms)
            .and_then(|crtc| kms.crtcs.get(&crtc))
            .map(|crtc| crtc.gamma_ramp_size())
            .unwrap_or(0)
    }

    fn crtc_for_queries(&self, kms: &KmsObjects) -> Option<drm::control::crtc::Handle> {
        self.pipeline.crtc().or_else(|| {
            let conn = kms.connectors.get(&self.connector())?;
            kms.mapper
                .candidate(self.connector(), conn.current_crtc(), &kms.possible_crtcs(conn))
        })
    }

    /// Set a gamma lookup table, `None` resets to linear
    pub fn set_gamma_ramp<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        ramp: Option<GammaRamp>,
    ) -> Result<ApplyOutcome, Error> {
        if let Some(ramp) = &ramp {
            let expected = self.gamma_ramp_size(kms);
            if ramp.size() != expected {
                return Err(Error::GammaSizeMismatch {
                    expected,
                    got: ramp.size(),
                });
            }
        }
        let mut state = self.pipeline.next_state().clone();
        state.gamma = ramp;
        self.queue_state_and_apply(device, kms, state)
    }

    /// Set a color transformation, `None` resets to identity
    pub fn set_color_transform<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        ctm: Option<ColorTransform>,
    ) -> Result<ApplyOutcome, Error> {
        let mut state = self.pipeline.next_state().clone();
        state.ctm = ctm;
        self.queue_state_and_apply(device, kms, state)
    }

    /// Returns true if the cursor has to be composited into the frame
    pub fn uses_software_cursor(&self) -> bool {
        self.config.software_cursor_only || !self.set_cursor_successful || !self.move_cursor_successful
    }

    fn has_cursor_plane(&self, kms: &KmsObjects) -> bool {
        self.crtc_for_queries(kms)
            .and_then(|crtc| kms.crtcs.get(&crtc))
            .and_then(|crtc| crtc.cursor_plane())
            .is_some()
    }

    fn fall_back_to_software<D: KmsDevice + ?Sized>(&mut self, device: &D, kms: &mut KmsObjects) {
        self.set_cursor_successful = false;
        if self.hw_cursor.visible && self.pipeline.can_commit() {
            // keep the plane from showing a stale image until the next frame
            if let Err(err) = self.pipeline.commit_cursor(device, kms, CursorState::hidden()) {
                debug!(parent: &self.span, ?err, "failed to hide cursor plane");
            }
        }
        self.hw_cursor = CursorState::hidden();
    }

    /// Set a new cursor image, `None` hides the cursor
    ///
    /// Uses the cursor plane if it can show the image, otherwise switches to a software
    /// cursor. Only errors unrelated to the cursor plane are returned.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn update_cursor<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        image: Option<&CursorImage>,
    ) -> Result<(), Error> {
        let Some(image) = image else {
            let was_visible = self.hw_cursor.visible;
            self.hw_cursor = CursorState::hidden();
            if was_visible && self.pipeline.can_commit() {
                self.pipeline.commit_cursor(device, kms, self.hw_cursor)?;
            }
            return Ok(());
        };
        self.cursor_hotspot = image.hotspot;

        let plane_size = kms.cursor_size;
        let reason = if self.config.software_cursor_only {
            Some("software cursors are forced")
        } else if !self.has_cursor_plane(kms) {
            Some("no cursor plane")
        } else if !plane_size.contains(image.size) {
            Some("cursor exceeds the plane size")
        } else if image.format != DrmFourcc::Argb8888 {
            Some("unsupported cursor format")
        } else if image.pixels.len() < (image.size.w * image.size.h * 4) as usize {
            Some("cursor image is truncated")
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(reason, size = ?image.size, "using software cursor");
            self.fall_back_to_software(device, kms);
            return Ok(());
        }

        if self.cursor_swapchain.size() != plane_size {
            self.cursor_swapchain.resize(&mut kms.framebuffers, plane_size);
        }
        let target = match self.cursor_swapchain.acquire(device, &mut kms.framebuffers) {
            Ok(target) => target,
            Err(err) => {
                debug!(?err, "no cursor buffer available, using software cursor");
                self.fall_back_to_software(device, kms);
                return Ok(());
            }
        };

        let data = pad_cursor(image, plane_size);
        let written = kms
            .framebuffers
            .begin_write(target.framebuffer)
            .and_then(|fb| {
                device
                    .write_framebuffer(fb.handle, &data)
                    .map_err(super::error::access("Failed to write cursor", device.dev_path()))
            });
        if let Err(err) = written {
            self.cursor_swapchain.discard(target.framebuffer);
            return Err(err);
        }

        let state = CursorState {
            fb: Some(target.framebuffer),
            position: self.cursor_position - self.cursor_hotspot,
            size: plane_size,
            visible: true,
        };
        if let Err(err) = self.pipeline.test_cursor(device, kms, &state) {
            debug!(?err, "cursor plane rejected the image, using software cursor");
            self.cursor_swapchain.discard(target.framebuffer);
            self.fall_back_to_software(device, kms);
            return Ok(());
        }

        if self.pipeline.can_commit() {
            if let Err(err) = self.pipeline.commit_cursor(device, kms, state) {
                debug!(?err, "cursor commit failed, using software cursor");
                self.cursor_swapchain.discard(target.framebuffer);
                self.fall_back_to_software(device, kms);
                return Ok(());
            }
        }
        // otherwise the next present carries the new image
        self.cursor_swapchain.submitted(target.framebuffer);
        self.hw_cursor = state;
        self.set_cursor_successful = true;
        self.move_cursor_successful = true;
        Ok(())
    }

    /// Move the cursor to a new pointer location
    ///
    /// With a hardware cursor only the plane position is committed.
    pub fn move_cursor<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        position: Point<i32, Physical>,
    ) -> Result<(), Error> {
        self.cursor_position = position;
        if self.uses_software_cursor() || !self.hw_cursor.visible {
            return Ok(());
        }
        let mut state = self.hw_cursor;
        state.position = position - self.cursor_hotspot;
        if self.pipeline.can_commit() {
            if let Err(err) = self.pipeline.commit_cursor(device, kms, state) {
                debug!(parent: &self.span, ?err, "cursor move failed, using software cursor");
                self.move_cursor_successful = false;
                return Ok(());
            }
        }
        self.hw_cursor = state;
        Ok(())
    }

    /// Handle a page-flip of the crtc driving this output
    ///
    /// Applies changes that were deferred while the commit was in flight. If that
    /// fails, the deferred changes are discarded and the power state stays as it was.
    pub fn page_flipped<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        crtc: drm::control::crtc::Handle,
    ) -> Option<FlipOutcome> {
        let kind = self.pipeline.page_flipped(device, kms, crtc)?;
        let pending_dpms = self.pending_dpms.take();
        let deferred_apply = self.pipeline.take_apply_request().then(|| {
            self.apply_queued_changes(device, kms).map_err(|err| {
                self.revert_queued_changes();
                err
            })
        });

        let dpms_changed = match (pending_dpms, &deferred_apply) {
            (Some(mode), Some(Ok(_))) => self.settle_dpms(mode),
            (Some(mode), _) => {
                warn!(parent: &self.span, ?mode, "deferred power state change was dropped");
                None
            }
            (None, _) => None,
        };
        Some(FlipOutcome {
            kind,
            deferred_apply,
            dpms_changed,
        })
    }

    /// The monitor got unplugged
    ///
    /// Tries to switch the crtc off, then forgets all kernel state.
    pub fn connector_lost<D: KmsDevice + ?Sized>(&mut self, device: &D, kms: &mut KmsObjects) {
        if self.pipeline.crtc().is_some() && !self.pipeline.is_pending() {
            let state = PipelineState::default();
            if let Err(err) = self.queue_state_and_apply(device, kms, state) {
                debug!(parent: &self.span, ?err, "failed to switch off crtc of unplugged connector");
            }
        }
        self.device_lost(kms);
        kms.collect_garbage(device);
    }

    /// The device or connector went away
    ///
    /// Pending state is discarded, framebuffers released and the output ends up disabled.
    pub fn device_lost(&mut self, kms: &mut KmsObjects) {
        self.pipeline.device_lost(kms);
        self.layer.rendered = None;
        self.layer.swapchain.release_all(&mut kms.framebuffers);
        self.cursor_swapchain.release_all(&mut kms.framebuffers);
        self.hw_cursor = CursorState::hidden();
        self.turn_off_deadline = None;
        self.pending_dpms = None;
    }
}

fn mode_size(mode: Mode) -> Size<u32, Physical> {
    let (w, h) = mode.size();
    (w as u32, h as u32).into()
}

/// Same size with the nearest refresh rate, otherwise the nearest area
fn closest_mode(modes: &[Mode], target: &Mode) -> Option<Mode> {
    let (tw, th) = target.size();
    let same_size = modes
        .iter()
        .filter(|m| m.size() == (tw, th))
        .min_by_key(|m| m.vrefresh().abs_diff(target.vrefresh()));
    if let Some(mode) = same_size {
        return Some(*mode);
    }
    let area = |(w, h): (u16, u16)| w as i64 * h as i64;
    modes
        .iter()
        .min_by_key(|m| (area(m.size()) - area((tw, th))).abs())
        .copied()
}

fn pad_cursor(image: &CursorImage, plane: Size<u32, Physical>) -> Vec<u8> {
    let stride = plane.w as usize * 4;
    let row = image.size.w as usize * 4;
    let mut data = vec![0u8; stride * plane.h as usize];
    if row == 0 {
        return data;
    }
    for (y, src) in image.pixels.chunks_exact(row).take(image.size.h as usize).enumerate() {
        data[y * stride..y * stride + row].copy_from_slice(src);
    }
    data
}
