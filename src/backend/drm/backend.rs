//! Entry point tying gpus, outputs and kernel events together
//!
//! A [`DrmBackend`] owns every [`DrmGpu`] and reports what happens to their outputs
//! through a [`calloop::channel`]. Operations on one gpu never touch another, and an
//! error on one output is reported for that output only.

use std::time::Instant;

use calloop::channel::{self, Channel, Sender};
use drm::control::{connector, crtc};
use indexmap::IndexMap;
use tracing::{debug, info, info_span, instrument, trace, warn};

use super::{
    color::{ColorTransform, GammaRamp},
    device::KmsDevice,
    error::Error,
    framebuffer::FramebufferId,
    gpu::{DrmGpu, KmsObjects},
    output::{CursorImage, DpmsMode, DrmOutput, OutputConfiguration, OutputMode},
    pipeline::ApplyOutcome,
    swapchain::RenderTarget,
    EventMetadata,
};
use crate::{
    config::DrmBackendConfig,
    utils::{Physical, Point},
};

/// Identifier of a gpu added to a [`DrmBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuId(pub(crate) u32);

impl GpuId {
    /// Raw numeric id, unique for the lifetime of the backend
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Identifier of an output: the gpu and the connector it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId {
    /// Gpu of the output
    pub gpu: GpuId,
    /// Connector of the output
    pub connector: connector::Handle,
}

/// Notifications about outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A monitor was connected
    Added(OutputId),
    /// A monitor was disconnected or its gpu went away
    Removed(OutputId),
    /// A frame or configuration reached the screen
    Presented {
        /// The output
        output: OutputId,
        /// Vblank sequence number
        sequence: u32,
        /// Timestamp of the page-flip
        time: std::time::Duration,
    },
    /// A configuration change could not be applied
    CommitFailed {
        /// The output
        output: OutputId,
    },
    /// The mode list of the connector changed
    ModesChanged(OutputId),
    /// The power state changed in the kernel
    DpmsChanged {
        /// The output
        output: OutputId,
        /// New power state
        mode: DpmsMode,
    },
}

/// All gpus and their outputs
#[derive(Debug)]
pub struct DrmBackend<D: KmsDevice> {
    gpus: IndexMap<GpuId, DrmGpu<D>>,
    next_gpu: u32,
    config: DrmBackendConfig,
    sender: Sender<OutputEvent>,
    span: tracing::Span,
}

impl<D: KmsDevice> DrmBackend<D> {
    /// Create an empty backend
    ///
    /// The returned channel can be inserted into a calloop event loop to receive
    /// [`OutputEvent`]s.
    pub fn new(config: DrmBackendConfig) -> (DrmBackend<D>, Channel<OutputEvent>) {
        let (sender, channel) = channel::channel();
        let span = info_span!("drm_backend");
        (
            DrmBackend {
                gpus: IndexMap::new(),
                next_gpu: 0,
                config,
                sender,
                span,
            },
            channel,
        )
    }

    /// Configuration used for new gpus and outputs
    pub fn config(&self) -> &DrmBackendConfig {
        &self.config
    }

    fn emit(&self, event: OutputEvent) {
        trace!(parent: &self.span, ?event, "output event");
        if self.sender.send(event).is_err() {
            debug!(parent: &self.span, "output event receiver is gone");
        }
    }

    fn emit_all(&self, events: impl IntoIterator<Item = OutputEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Take over a device and create outputs for its connected connectors
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn add_gpu(&mut self, device: D) -> Result<GpuId, Error> {
        let id = GpuId(self.next_gpu);
        let mut gpu = DrmGpu::new(id, device, &self.config)?;
        self.next_gpu += 1;
        let events = gpu.scan_connectors()?;
        self.gpus.insert(id, gpu);
        self.emit_all(events);
        Ok(id)
    }

    /// Switch off and drop every output of a gpu
    ///
    /// Other gpus are not affected. Returns false if the gpu is unknown.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn remove_gpu(&mut self, gpu: GpuId) -> bool {
        let Some(mut removed) = self.gpus.shift_remove(&gpu) else {
            return false;
        };
        let events = removed.teardown();
        self.emit_all(events);
        true
    }

    /// Rescan the connectors of a gpu after a hotplug notification
    pub fn handle_hotplug(&mut self, gpu: GpuId) -> Result<(), Error> {
        let result = self.gpu_mut(gpu)?.scan_connectors();
        match result {
            Ok(events) => {
                self.emit_all(events);
                Ok(())
            }
            Err(err) => Err(self.check_device_lost(gpu, err)),
        }
    }

    /// Handle a page-flip reported for a crtc of a gpu
    pub fn on_page_flip(&mut self, gpu: GpuId, crtc: crtc::Handle, metadata: EventMetadata) {
        let Some(events) = self.gpus.get_mut(&gpu).map(|g| g.on_page_flip(crtc, metadata)) else {
            debug!(parent: &self.span, ?gpu, "page-flip for an unknown gpu");
            return;
        };
        self.emit_all(events);
    }

    /// Read and route all pending kernel events of a gpu
    pub fn dispatch_device_events(&mut self, gpu: GpuId) -> Result<(), Error> {
        let result = self.gpu_mut(gpu)?.dispatch_device_events();
        match result {
            Ok(events) => {
                self.emit_all(events);
                Ok(())
            }
            Err(err) => Err(self.check_device_lost(gpu, err)),
        }
    }

    fn gpu_mut(&mut self, gpu: GpuId) -> Result<&mut DrmGpu<D>, Error> {
        self.gpus.get_mut(&gpu).ok_or(Error::DeviceInactive)
    }

    fn check_device_lost(&mut self, gpu: GpuId, err: Error) -> Error {
        if err.is_device_lost() {
            if let Some(lost) = self.gpus.get_mut(&gpu) {
                let events = lost.device_lost();
                self.emit_all(events);
            }
        }
        err
    }

    fn with_output<R>(
        &mut self,
        id: OutputId,
        f: impl FnOnce(&mut DrmOutput, &D, &mut KmsObjects) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let result = self
            .gpu_mut(id.gpu)?
            .with_output(id.connector, f)
            .ok_or(Error::UnknownConnector)?;
        result.map_err(|err| self.check_device_lost(id.gpu, err))
    }

    /// Acquire the framebuffer to render the next frame of an output into
    pub fn begin_frame(&mut self, id: OutputId) -> Result<RenderTarget, Error> {
        self.with_output(id, |output, device, kms| {
            output.output_layer().begin_frame(device, &mut kms.framebuffers)
        })
    }

    /// Copy pixel data into a framebuffer acquired with [`DrmBackend::begin_frame`]
    pub fn write_frame(&mut self, id: OutputId, fb: FramebufferId, pixels: &[u8]) -> Result<(), Error> {
        self.with_output(id, |output, device, kms| {
            output.output_layer().write_frame(device, &kms.framebuffers, fb, pixels)
        })
    }

    /// Show the rendered frame of an output
    ///
    /// On failure the frame is dropped, render again on the next page-flip.
    pub fn present(&mut self, id: OutputId) -> Result<(), Error> {
        self.with_output(id, |output, device, kms| output.present(device, kms))
    }

    /// Apply a set of output configurations
    ///
    /// All configurations are validated first, if one is rejected nothing changes and
    /// the error is returned. Otherwise every output applies its configuration, a
    /// failure only affects that output and is reported in the returned list as well
    /// as through [`OutputEvent::CommitFailed`].
    #[instrument(level = "debug", parent = &self.span, skip_all, fields(outputs = changes.len()))]
    pub fn apply_output_configuration(
        &mut self,
        changes: &[(OutputId, OutputConfiguration)],
    ) -> Result<Vec<(OutputId, Result<ApplyOutcome, Error>)>, Error> {
        let mut queued = Vec::with_capacity(changes.len());
        for (id, config) in changes {
            let result = match self.gpus.get_mut(&id.gpu) {
                Some(gpu) => gpu
                    .with_output(id.connector, |output, _, kms| output.queue_changes(kms, config))
                    .unwrap_or(Err(Error::UnknownConnector)),
                None => Err(Error::DeviceInactive),
            };
            if let Err(err) = result {
                warn!(output = ?id, ?err, "configuration rejected, reverting all outputs");
                for id in queued.into_iter().chain(std::iter::once(*id)) {
                    self.revert_queued_changes(id);
                }
                return Err(err);
            }
            queued.push(*id);
        }

        let mut results = Vec::with_capacity(queued.len());
        for id in queued {
            let result = self.with_output(id, |output, device, kms| {
                output.apply_queued_changes(device, kms).map_err(|err| {
                    output.revert_queued_changes();
                    err
                })
            });
            if let Err(err) = &result {
                warn!(parent: &self.span, output = ?id, ?err, "failed to apply configuration");
                self.emit(OutputEvent::CommitFailed { output: id });
            }
            results.push((id, result));
        }
        Ok(results)
    }

    /// Discard the queued configuration of an output
    pub fn revert_queued_changes(&mut self, id: OutputId) {
        if let Some(gpu) = self.gpus.get_mut(&id.gpu) {
            gpu.with_output(id.connector, |output, _, _| output.revert_queued_changes());
        }
    }

    /// Enable or disable an output, keeping the rest of its configuration
    pub fn update_enablement(&mut self, id: OutputId, enabled: bool) -> Result<ApplyOutcome, Error> {
        self.with_output(id, |output, device, kms| output.update_enablement(device, kms, enabled))
    }

    /// Request a power state for an output
    ///
    /// Powering off is delayed, see [`DrmBackend::dispatch_timers`]. While a commit is
    /// in flight the change waits for its page-flip, `DpmsChanged` follows once it was
    /// committed.
    pub fn set_dpms_mode(&mut self, id: OutputId, mode: DpmsMode) -> Result<(), Error> {
        let now = Instant::now();
        let changed = self.with_output(id, |output, device, kms| output.set_dpms_mode(device, kms, mode, now))?;
        if let Some(mode) = changed {
            self.emit(OutputEvent::DpmsChanged { output: id, mode });
        }
        Ok(())
    }

    /// Earliest deadline of any scheduled power-off
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.gpus
            .values()
            .flat_map(|gpu| gpu.outputs())
            .filter_map(|output| output.next_timer_deadline())
            .min()
    }

    /// Perform all scheduled power-offs that are due at `now`
    pub fn dispatch_timers(&mut self, now: Instant) {
        let due: Vec<OutputId> = self
            .outputs()
            .filter(|(_, output)| output.next_timer_deadline().is_some_and(|d| d <= now))
            .map(|(id, _)| id)
            .collect();
        for id in due {
            match self.with_output(id, |output, device, kms| output.dispatch_timer(device, kms, now)) {
                Ok(Some(mode)) => self.emit(OutputEvent::DpmsChanged { output: id, mode }),
                Ok(None) => {}
                Err(err) => {
                    warn!(parent: &self.span, output = ?id, ?err, "scheduled power-off failed");
                    self.emit(OutputEvent::CommitFailed { output: id });
                }
            }
        }
    }

    /// Set the gamma lookup table of an output, `None` resets it
    pub fn set_gamma_ramp(&mut self, id: OutputId, ramp: Option<GammaRamp>) -> Result<ApplyOutcome, Error> {
        self.with_output(id, |output, device, kms| output.set_gamma_ramp(device, kms, ramp))
    }

    /// Set the color transformation of an output, `None` resets it
    pub fn set_color_transform(
        &mut self,
        id: OutputId,
        ctm: Option<ColorTransform>,
    ) -> Result<ApplyOutcome, Error> {
        self.with_output(id, |output, device, kms| output.set_color_transform(device, kms, ctm))
    }

    /// Set the cursor image of an output, `None` hides the cursor
    pub fn update_cursor(&mut self, id: OutputId, image: Option<&CursorImage>) -> Result<(), Error> {
        self.with_output(id, |output, device, kms| output.update_cursor(device, kms, image))
    }

    /// Move the cursor of an output
    pub fn move_cursor(&mut self, id: OutputId, position: Point<i32, Physical>) -> Result<(), Error> {
        self.with_output(id, |output, device, kms| output.move_cursor(device, kms, position))
    }

    /// Modes of an output, flagged as preferred and current
    pub fn modes(&self, id: OutputId) -> Vec<OutputMode> {
        self.gpus
            .get(&id.gpu)
            .and_then(|gpu| gpu.output(id.connector).map(|output| output.modes(gpu.kms())))
            .unwrap_or_default()
    }

    /// All outputs of all gpus
    pub fn outputs(&self) -> impl Iterator<Item = (OutputId, &DrmOutput)> {
        self.gpus.iter().flat_map(|(gpu, g)| {
            g.outputs().map(move |output| {
                (
                    OutputId {
                        gpu: *gpu,
                        connector: output.connector(),
                    },
                    output,
                )
            })
        })
    }

    /// An output by id
    pub fn output(&self, id: OutputId) -> Option<&DrmOutput> {
        self.gpus.get(&id.gpu)?.output(id.connector)
    }

    /// A gpu by id
    pub fn gpu(&self, id: GpuId) -> Option<&DrmGpu<D>> {
        self.gpus.get(&id)
    }

    /// All gpus
    pub fn gpus(&self) -> impl Iterator<Item = &DrmGpu<D>> {
        self.gpus.values()
    }
}

impl<D: KmsDevice> Drop for DrmBackend<D> {
    fn drop(&mut self) {
        if !self.gpus.is_empty() {
            info!(parent: &self.span, gpus = self.gpus.len(), "shutting down");
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use calloop::{channel::Event, EventLoop};
    use drm_fourcc::DrmFourcc;

    use super::{DrmBackend, OutputEvent, OutputId};
    use crate::{
        backend::drm::{
            color::GammaRamp,
            device::test::{preferred_mode, test_mode, TestDevice, TestOutput},
            error::Error,
            output::{CursorImage, DpmsMode, OutputConfiguration},
            pipeline::ApplyOutcome,
        },
        config::DrmBackendConfig,
    };

    struct Harness {
        backend: DrmBackend<TestDevice>,
        event_loop: EventLoop<'static, Vec<OutputEvent>>,
        received: Vec<OutputEvent>,
    }

    impl Harness {
        fn new(config: DrmBackendConfig) -> Harness {
            let (backend, channel) = DrmBackend::new(config);
            let event_loop = EventLoop::try_new().unwrap();
            event_loop
                .handle()
                .insert_source(channel, |event, _, received: &mut Vec<OutputEvent>| {
                    if let Event::Msg(event) = event {
                        received.push(event);
                    }
                })
                .unwrap();
            Harness {
                backend,
                event_loop,
                received: Vec::new(),
            }
        }

        fn events(&mut self) -> Vec<OutputEvent> {
            self.event_loop
                .dispatch(Some(Duration::ZERO), &mut self.received)
                .unwrap();
            std::mem::take(&mut self.received)
        }
    }

    fn mode_a() -> drm::control::Mode {
        preferred_mode(1920, 1080, 60)
    }

    fn mode_b() -> drm::control::Mode {
        test_mode(2560, 1440, 60)
    }

    /// A backend with one gpu and one enabled output in mode A, page-flip delivered
    fn enabled_output(config: DrmBackendConfig) -> (Harness, TestDevice, TestOutput, OutputId) {
        let mut harness = Harness::new(config);
        let (device, out) = TestDevice::single_output("DP-1", vec![mode_a(), mode_b()]);
        let gpu = harness.backend.add_gpu(device.clone()).unwrap();
        let id = OutputId {
            gpu,
            connector: out.connector,
        };
        let results = harness
            .backend
            .apply_output_configuration(&[(id, OutputConfiguration::default())])
            .unwrap();
        assert!(matches!(results[0].1, Ok(ApplyOutcome::Pending)));
        harness.backend.dispatch_device_events(gpu).unwrap();
        harness.events();
        (harness, device, out, id)
    }

    fn configure(harness: &mut Harness, id: OutputId, config: OutputConfiguration) -> Result<ApplyOutcome, Error> {
        let mut results = harness.backend.apply_output_configuration(&[(id, config)])?;
        results.remove(0).1
    }

    #[test]
    fn adding_a_gpu_reports_outputs() {
        let mut harness = Harness::new(DrmBackendConfig::default());
        let (device, out) = TestDevice::single_output("DP-1", vec![mode_a()]);
        let gpu = harness.backend.add_gpu(device).unwrap();
        let id = OutputId {
            gpu,
            connector: out.connector,
        };
        assert_eq!(harness.events(), vec![OutputEvent::Added(id)]);
        let output = harness.backend.output(id).unwrap();
        assert_eq!(output.name(), "DP-1");
        assert!(!output.is_enabled());
        assert_eq!(output.physical_size(), Some((600, 340)));
    }

    #[test]
    fn enabling_an_output_flips_after_the_event() {
        let mut harness = Harness::new(DrmBackendConfig::default());
        let (device, out) = TestDevice::single_output("DP-1", vec![mode_a()]);
        let gpu = harness.backend.add_gpu(device.clone()).unwrap();
        let id = OutputId {
            gpu,
            connector: out.connector,
        };
        harness.events();

        configure(&mut harness, id, OutputConfiguration::default()).unwrap();
        let output = harness.backend.output(id).unwrap();
        assert!(output.pipeline().is_pending());
        assert!(!output.is_enabled());
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(1));

        harness.backend.dispatch_device_events(gpu).unwrap();
        let events = harness.events();
        assert!(matches!(events[..], [OutputEvent::Presented { output, sequence: 1, .. }] if output == id));
        let output = harness.backend.output(id).unwrap();
        assert!(output.is_enabled());
        assert_eq!(output.current_mode(), Some(mode_a()));
        let crtc = harness.backend.gpu(gpu).unwrap().kms().crtc(out.crtc).unwrap();
        assert!(crtc.buffers().current().is_some());
        assert!(crtc.buffers().next().is_none());
    }

    #[test]
    fn mode_switch_swaps_buffers() {
        let (mut harness, device, out, id) = enabled_output(DrmBackendConfig::default());
        let config = OutputConfiguration {
            mode: Some(mode_b()),
            ..Default::default()
        };
        assert!(matches!(configure(&mut harness, id, config), Ok(ApplyOutcome::Pending)));
        let commit = device.last_commit().unwrap();
        assert!(commit.flags.contains(drm::control::AtomicCommitFlags::ALLOW_MODESET));
        assert_eq!(device.mode_size(out.crtc), Some((2560, 1440)));

        harness.backend.dispatch_device_events(id.gpu).unwrap();
        let output = harness.backend.output(id).unwrap();
        assert_eq!(output.current_mode(), Some(mode_b()));

        let gpu = harness.backend.gpu(id.gpu).unwrap();
        let crtc = gpu.kms().crtc(out.crtc).unwrap();
        assert!(crtc.buffers().next().is_none());
        let current = crtc.buffers().current().unwrap();
        let fb = gpu.kms().framebuffers().get(current).unwrap();
        assert_eq!((fb.size.w, fb.size.h), (2560, 1440));
        // the framebuffer of mode a is gone once nothing scans it out
        assert_eq!(device.live_framebuffers(), 1);
    }

    #[test]
    fn failed_commit_keeps_state() {
        let (mut harness, device, out, id) = enabled_output(DrmBackendConfig::default());
        let (current, blobs, fbs) = {
            let crtc = harness.backend.gpu(id.gpu).unwrap().kms().crtc(out.crtc).unwrap();
            (crtc.buffers().current(), device.live_blobs(), device.live_framebuffers())
        };

        device.fail_next_commits(1);
        let config = OutputConfiguration {
            mode: Some(mode_b()),
            ..Default::default()
        };
        assert!(matches!(configure(&mut harness, id, config), Err(Error::TestFailed(_))));
        assert_eq!(harness.events(), vec![OutputEvent::CommitFailed { output: id }]);

        let output = harness.backend.output(id).unwrap();
        assert_eq!(output.current_mode(), Some(mode_a()));
        assert!(output.is_enabled());
        assert!(!output.pipeline().is_pending());
        assert!(output.pipeline().queued_state().is_none());
        let crtc = harness.backend.gpu(id.gpu).unwrap().kms().crtc(out.crtc).unwrap();
        assert_eq!(crtc.buffers().current(), current);
        assert!(crtc.buffers().next().is_none());
        assert_eq!(device.mode_size(out.crtc), Some((1920, 1080)));
        assert_eq!(device.live_blobs(), blobs);
        assert_eq!(device.live_framebuffers(), fbs);
    }

    #[test]
    fn one_commit_in_flight() {
        let (mut harness, device, _out, id) = enabled_output(DrmBackendConfig::default());
        let target = harness.backend.begin_frame(id).unwrap();
        harness
            .backend
            .write_frame(id, target.framebuffer, &[0xff; 16])
            .unwrap();
        harness.backend.present(id).unwrap();
        let submitted = device.commits().len();

        let config = OutputConfiguration {
            mode: Some(mode_b()),
            ..Default::default()
        };
        assert_eq!(configure(&mut harness, id, config.clone()).unwrap(), ApplyOutcome::Deferred);
        assert_eq!(device.commits().len(), submitted);
        let output = harness.backend.output(id).unwrap();
        assert!(output.pipeline().queued_state().is_some());

        harness.backend.begin_frame(id).unwrap();
        assert!(matches!(harness.backend.present(id), Err(Error::FlipPending(_))));

        // the deferred change goes out with the page-flip
        harness.backend.dispatch_device_events(id.gpu).unwrap();
        let output = harness.backend.output(id).unwrap();
        assert!(output.pipeline().is_pending());
        assert_eq!(output.pipeline().pending_state().unwrap().mode, Some(mode_b()));
        harness.backend.dispatch_device_events(id.gpu).unwrap();
        assert_eq!(harness.backend.output(id).unwrap().current_mode(), Some(mode_b()));
    }

    #[test]
    fn unsupported_mode_is_rejected() {
        let (mut harness, device, _out, id) = enabled_output(DrmBackendConfig::default());
        let submitted = device.commits().len();
        let config = OutputConfiguration {
            mode: Some(test_mode(3840, 2160, 60)),
            ..Default::default()
        };
        assert!(matches!(
            harness.backend.apply_output_configuration(&[(id, config)]),
            Err(Error::ModeNotSuitable(_))
        ));
        let output = harness.backend.output(id).unwrap();
        assert_eq!(output.current_mode(), Some(mode_a()));
        assert!(output.pipeline().queued_state().is_none());
        assert_eq!(device.commits().len(), submitted);
    }

    #[test]
    fn revert_discards_queued_state() {
        let (mut harness, _device, _out, id) = enabled_output(DrmBackendConfig::default());
        harness
            .backend
            .gpus
            .get_mut(&id.gpu)
            .unwrap()
            .with_output(id.connector, |output, _, kms| {
                let config = OutputConfiguration {
                    mode: Some(mode_b()),
                    ..Default::default()
                };
                output.queue_changes(kms, &config).unwrap();
                assert_eq!(output.pipeline().next_state().mode, Some(mode_b()));
            });
        harness.backend.revert_queued_changes(id);
        let output = harness.backend.output(id).unwrap();
        assert!(output.pipeline().queued_state().is_none());
        assert_eq!(output.current_mode(), Some(mode_a()));
    }

    #[test]
    fn disable_wins_over_mode_change() {
        let (mut harness, device, out, id) = enabled_output(DrmBackendConfig::default());
        let config = OutputConfiguration {
            enabled: false,
            mode: Some(mode_b()),
            vrr: true,
            ..Default::default()
        };
        assert_eq!(configure(&mut harness, id, config).unwrap(), ApplyOutcome::Committed);
        let output = harness.backend.output(id).unwrap();
        assert!(!output.is_enabled());
        assert!(output.pipeline().crtc().is_none());
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(0));
        assert_eq!(device.property(out.connector, "CRTC_ID"), Some(0));
        assert_eq!(device.live_framebuffers(), 0);
    }

    #[test]
    fn rejected_configuration_reverts_every_output() {
        let mut harness = Harness::new(DrmBackendConfig::default());
        let device = TestDevice::new();
        let c1 = device.add_crtc();
        let c2 = device.add_crtc();
        device.add_plane(crate::backend::drm::PlaneType::Primary, &[c1]);
        device.add_plane(crate::backend::drm::PlaneType::Primary, &[c2]);
        let dp1 = device.add_connector("DP-1", vec![mode_a()], &[c1, c2]);
        let dp2 = device.add_connector("DP-2", vec![mode_a()], &[c1, c2]);
        let gpu = harness.backend.add_gpu(device.clone()).unwrap();
        let first = OutputId { gpu, connector: dp1 };
        let second = OutputId { gpu, connector: dp2 };

        let bad = OutputConfiguration {
            scale: 0.0,
            ..Default::default()
        };
        let result = harness
            .backend
            .apply_output_configuration(&[(first, OutputConfiguration::default()), (second, bad)]);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
        for id in [first, second] {
            assert!(harness.backend.output(id).unwrap().pipeline().queued_state().is_none());
        }
        assert!(device.commits().is_empty());

        let results = harness
            .backend
            .apply_output_configuration(&[
                (first, OutputConfiguration::default()),
                (second, OutputConfiguration::default()),
            ])
            .unwrap();
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(ApplyOutcome::Pending))));
        let crtcs: Vec<_> = [first, second]
            .iter()
            .map(|id| harness.backend.output(*id).unwrap().pipeline().crtc().unwrap())
            .collect();
        assert_ne!(crtcs[0], crtcs[1]);
    }

    #[test]
    fn oversized_cursor_falls_back_to_software() {
        let (mut harness, device, out, id) = enabled_output(DrmBackendConfig::default());
        let small = CursorImage {
            size: (32, 32).into(),
            hotspot: (4, 4).into(),
            format: DrmFourcc::Argb8888,
            pixels: vec![0xff; 32 * 32 * 4],
        };
        harness.backend.update_cursor(id, Some(&small)).unwrap();
        assert!(!harness.backend.output(id).unwrap().uses_software_cursor());
        let cursor_fb = device.last_commit().unwrap().value(out.cursor, "FB_ID").unwrap();
        assert_ne!(cursor_fb, 0);
        harness.backend.dispatch_device_events(id.gpu).unwrap();

        harness.backend.move_cursor(id, (100, 50).into()).unwrap();
        let commit = device.last_commit().unwrap();
        assert_eq!(commit.writes.len(), 2);
        assert_eq!(commit.value(out.cursor, "CRTC_X"), Some(96));
        harness.backend.dispatch_device_events(id.gpu).unwrap();

        let large = CursorImage {
            size: (128, 128).into(),
            hotspot: (0, 0).into(),
            format: DrmFourcc::Argb8888,
            pixels: vec![0xff; 128 * 128 * 4],
        };
        harness.backend.update_cursor(id, Some(&large)).unwrap();
        assert!(harness.backend.output(id).unwrap().uses_software_cursor());
        assert_eq!(device.last_commit().unwrap().value(out.cursor, "FB_ID"), Some(0));
        harness.backend.dispatch_device_events(id.gpu).unwrap();

        harness.backend.begin_frame(id).unwrap();
        harness.backend.present(id).unwrap();
        let commit = device.last_commit().unwrap();
        assert!(commit.touches(out.primary));
        assert!(!commit.touches(out.cursor));
        assert_eq!(device.property(out.cursor, "FB_ID"), Some(0));
    }

    #[test]
    fn dpms_off_is_delayed() {
        let config = DrmBackendConfig {
            dpms_turn_off_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let (mut harness, device, out, id) = enabled_output(config);
        harness.backend.set_dpms_mode(id, DpmsMode::Off).unwrap();
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(1));
        assert!(harness.backend.next_timer_deadline().is_some());

        // resuming before the deadline cancels the power-off
        harness.backend.set_dpms_mode(id, DpmsMode::On).unwrap();
        assert!(harness.backend.next_timer_deadline().is_none());
        assert!(harness.events().is_empty());

        harness.backend.set_dpms_mode(id, DpmsMode::Off).unwrap();
        harness.backend.dispatch_timers(Instant::now());
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(1));
        harness
            .backend
            .dispatch_timers(Instant::now() + Duration::from_secs(1));
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(0));
        assert_eq!(
            harness.events(),
            vec![OutputEvent::DpmsChanged {
                output: id,
                mode: DpmsMode::Off
            }]
        );
        let output = harness.backend.output(id).unwrap();
        assert_eq!(output.dpms_mode(), DpmsMode::Off);
        assert!(output.is_enabled());
        assert!(matches!(harness.backend.present(id), Err(Error::NoRenderedFrame)));

        harness.backend.set_dpms_mode(id, DpmsMode::On).unwrap();
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(1));
        harness.backend.dispatch_device_events(id.gpu).unwrap();
        assert_eq!(harness.backend.output(id).unwrap().dpms_mode(), DpmsMode::On);
    }

    #[test]
    fn gamma_ramp_is_validated_and_uploaded() {
        let (mut harness, device, out, id) = enabled_output(DrmBackendConfig::default());
        let short = GammaRamp::identity(16);
        assert!(matches!(
            harness.backend.set_gamma_ramp(id, Some(short)),
            Err(Error::GammaSizeMismatch { expected: 256, got: 16 })
        ));

        let identity = GammaRamp::identity(256);
        let ramp = GammaRamp::new(identity.red().to_vec(), identity.green().to_vec(), vec![0; 256]).unwrap();
        assert_eq!(harness.backend.set_gamma_ramp(id, Some(ramp)).unwrap(), ApplyOutcome::Pending);
        let blob = device.property(out.crtc, "GAMMA_LUT").unwrap();
        assert_eq!(device.blob_data(blob).unwrap().len(), 256 * 8);
        assert!(!device.last_commit().unwrap().flags.contains(drm::control::AtomicCommitFlags::ALLOW_MODESET));
    }

    fn immediate_power_off() -> DrmBackendConfig {
        DrmBackendConfig {
            dpms_turn_off_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn configuration_while_powered_off_reaches_the_kernel() {
        let (mut harness, device, out, id) = enabled_output(immediate_power_off());
        harness.backend.set_dpms_mode(id, DpmsMode::Off).unwrap();
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(0));

        let config = OutputConfiguration {
            mode: Some(mode_b()),
            ..Default::default()
        };
        assert_eq!(configure(&mut harness, id, config).unwrap(), ApplyOutcome::Committed);
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(0));
        assert_eq!(device.mode_size(out.crtc), Some((2560, 1440)));

        let identity = GammaRamp::identity(256);
        let ramp = GammaRamp::new(identity.red().to_vec(), identity.green().to_vec(), vec![0; 256]).unwrap();
        assert_eq!(harness.backend.set_gamma_ramp(id, Some(ramp)).unwrap(), ApplyOutcome::Committed);
        assert_ne!(device.property(out.crtc, "GAMMA_LUT"), Some(0));

        harness.backend.set_dpms_mode(id, DpmsMode::On).unwrap();
        harness.backend.dispatch_device_events(id.gpu).unwrap();
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(1));
        assert_eq!(device.mode_size(out.crtc), Some((2560, 1440)));
        assert_ne!(device.property(out.crtc, "GAMMA_LUT"), Some(0));

        let output = harness.backend.output(id).unwrap();
        assert_eq!(output.current_mode(), Some(mode_b()));
        assert_eq!(output.dpms_mode(), DpmsMode::On);
        let gpu = harness.backend.gpu(id.gpu).unwrap();
        let current = gpu.kms().crtc(out.crtc).unwrap().buffers().current().unwrap();
        let fb = gpu.kms().framebuffers().get(current).unwrap();
        assert_eq!((fb.size.w, fb.size.h), (2560, 1440));
    }

    #[test]
    fn power_off_waits_for_the_page_flip() {
        let (mut harness, device, out, id) = enabled_output(immediate_power_off());
        harness.backend.begin_frame(id).unwrap();
        harness.backend.present(id).unwrap();

        harness.backend.set_dpms_mode(id, DpmsMode::Off).unwrap();
        assert!(harness.events().is_empty());
        assert_eq!(harness.backend.output(id).unwrap().dpms_mode(), DpmsMode::On);
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(1));

        harness.backend.dispatch_device_events(id.gpu).unwrap();
        let events = harness.events();
        assert!(matches!(
            events[..],
            [
                OutputEvent::Presented { .. },
                OutputEvent::DpmsChanged {
                    mode: DpmsMode::Off,
                    ..
                }
            ]
        ));
        assert_eq!(harness.backend.output(id).unwrap().dpms_mode(), DpmsMode::Off);
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(0));
    }

    #[test]
    fn rejected_deferred_power_off_keeps_the_output_on() {
        let (mut harness, device, out, id) = enabled_output(immediate_power_off());
        harness.backend.begin_frame(id).unwrap();
        harness.backend.present(id).unwrap();
        harness.backend.set_dpms_mode(id, DpmsMode::Off).unwrap();

        device.fail_next_commits(1);
        harness.backend.dispatch_device_events(id.gpu).unwrap();
        let events = harness.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], OutputEvent::Presented { .. }));
        assert_eq!(events[1], OutputEvent::CommitFailed { output: id });

        let output = harness.backend.output(id).unwrap();
        assert_eq!(output.dpms_mode(), DpmsMode::On);
        assert!(output.pipeline().queued_state().is_none());
        assert!(output.pipeline().active_state().active);
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(1));

        // still presenting
        harness.backend.begin_frame(id).unwrap();
        harness.backend.present(id).unwrap();
        assert!(harness.backend.output(id).unwrap().pipeline().is_pending());
    }

    #[test]
    fn hotplug_adds_and_removes_outputs() {
        let (mut harness, device, out, id) = enabled_output(DrmBackendConfig::default());
        device.set_connected(out.connector, false);
        harness.backend.handle_hotplug(id.gpu).unwrap();
        assert_eq!(harness.events(), vec![OutputEvent::Removed(id)]);
        assert!(harness.backend.output(id).is_none());
        assert_eq!(device.property(out.crtc, "ACTIVE"), Some(0));
        assert_eq!(device.live_framebuffers(), 0);

        device.set_connected(out.connector, true);
        harness.backend.handle_hotplug(id.gpu).unwrap();
        assert_eq!(harness.events(), vec![OutputEvent::Added(id)]);
        assert!(!harness.backend.output(id).unwrap().is_enabled());
    }

    #[test]
    fn vanished_mode_falls_back_to_closest() {
        let (mut harness, device, out, id) = enabled_output(DrmBackendConfig::default());
        device.set_modes(out.connector, vec![test_mode(1920, 1080, 50), mode_b()]);
        harness.backend.handle_hotplug(id.gpu).unwrap();
        assert_eq!(harness.events(), vec![OutputEvent::ModesChanged(id)]);
        harness.backend.dispatch_device_events(id.gpu).unwrap();
        let output = harness.backend.output(id).unwrap();
        assert_eq!(output.current_mode(), Some(test_mode(1920, 1080, 50)));
        let modes = harness.backend.modes(id);
        assert_eq!(modes.len(), 2);
        assert!(modes[0].current);
    }

    #[test]
    fn lost_gpu_does_not_affect_others() {
        let (mut harness, lost, _out, lost_id) = enabled_output(DrmBackendConfig::default());
        let (device, out) = TestDevice::single_output("HDMI-A-1", vec![mode_a()]);
        let gpu = harness.backend.add_gpu(device.clone()).unwrap();
        let other = OutputId {
            gpu,
            connector: out.connector,
        };
        configure(&mut harness, other, OutputConfiguration::default()).unwrap();
        harness.backend.dispatch_device_events(gpu).unwrap();
        harness.events();

        lost.remove();
        harness.backend.begin_frame(lost_id).unwrap_err();
        assert!(harness.backend.present(lost_id).is_err());
        assert!(harness.backend.output(lost_id).is_none());
        assert_eq!(harness.events(), vec![OutputEvent::Removed(lost_id)]);

        harness.backend.begin_frame(other).unwrap();
        harness.backend.present(other).unwrap();
        assert!(harness.backend.output(other).unwrap().pipeline().is_pending());

        assert!(harness.backend.remove_gpu(lost_id.gpu));
        assert!(!harness.backend.remove_gpu(lost_id.gpu));
        assert!(harness.backend.output(other).is_some());
    }
}
