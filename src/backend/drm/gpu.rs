//! Per-device registry of kernel objects and outputs

use drm::control::{connector, crtc, plane};
use indexmap::IndexMap;
use tracing::{debug, info, info_span, instrument, trace, warn};

use super::{
    backend::{GpuId, OutputEvent, OutputId},
    commit::{AtomicCommit, CommitMode},
    connector::Connector,
    crtc::Crtc,
    device::KmsDevice,
    error::{access, Error},
    framebuffer::Framebuffers,
    object::ObjectId,
    output::DrmOutput,
    pipeline::CommitKind,
    plane::Plane,
    scanner::{ConnectorScanner, CrtcMapper},
    EventMetadata, PlaneType,
};
use crate::{
    config::DrmBackendConfig,
    utils::{Physical, Size},
};

/// Kernel objects of one device, shared by all its pipelines
#[derive(Debug)]
pub struct KmsObjects {
    pub(crate) crtcs: IndexMap<crtc::Handle, Crtc>,
    pub(crate) planes: IndexMap<plane::Handle, Plane>,
    pub(crate) connectors: IndexMap<connector::Handle, Connector>,
    pub(crate) framebuffers: Framebuffers,
    pub(crate) mapper: CrtcMapper,
    pub(crate) cursor_size: Size<u32, Physical>,
}

impl KmsObjects {
    /// Enumerate all objects of a device
    ///
    /// Every crtc gets a primary and, if available, a cursor plane. Crtcs without a
    /// usable primary plane are ignored.
    pub fn scan<D: KmsDevice + ?Sized>(device: &D) -> Result<KmsObjects, Error> {
        let resources = device
            .resource_handles()
            .map_err(access("Error loading drm resources", device.dev_path()))?;

        let mut planes = IndexMap::new();
        for handle in resources.planes {
            planes.insert(handle, Plane::new(device, handle)?);
        }

        let mut crtcs = IndexMap::new();
        let mut assigned: Vec<plane::Handle> = Vec::new();
        for (pipe_index, handle) in resources.crtcs.into_iter().enumerate() {
            let mut find_plane = |kind: PlaneType| {
                let plane = planes
                    .values()
                    .find(|p: &&Plane| p.kind() == kind && p.is_compatible(handle) && !assigned.contains(&p.handle()))
                    .map(|p| p.handle());
                if let Some(plane) = plane {
                    assigned.push(plane);
                }
                plane
            };
            let Some(primary) = find_plane(PlaneType::Primary) else {
                warn!(crtc = ?handle, "no primary plane, ignoring crtc");
                continue;
            };
            let cursor = find_plane(PlaneType::Cursor);
            trace!(crtc = ?handle, ?primary, ?cursor, "planes assigned");
            crtcs.insert(handle, Crtc::new(device, handle, pipe_index, primary, cursor)?);
        }

        let mut connectors = IndexMap::new();
        for handle in resources.connectors {
            connectors.insert(handle, Connector::new(device, handle)?);
        }

        Ok(KmsObjects {
            crtcs,
            planes,
            connectors,
            framebuffers: Framebuffers::default(),
            mapper: CrtcMapper::new(),
            cursor_size: device.cursor_size(),
        })
    }

    /// Crtcs of this device able to drive the connector, in pipe order
    pub fn possible_crtcs(&self, connector: &Connector) -> Vec<crtc::Handle> {
        self.crtcs
            .keys()
            .filter(|crtc| connector.possible_crtcs().contains(crtc))
            .copied()
            .collect()
    }

    /// All crtcs
    pub fn crtcs(&self) -> impl Iterator<Item = &Crtc> {
        self.crtcs.values()
    }

    /// A crtc by handle
    pub fn crtc(&self, handle: crtc::Handle) -> Option<&Crtc> {
        self.crtcs.get(&handle)
    }

    /// A plane by handle
    pub fn plane(&self, handle: plane::Handle) -> Option<&Plane> {
        self.planes.get(&handle)
    }

    /// A connector by handle
    pub fn connector(&self, handle: connector::Handle) -> Option<&Connector> {
        self.connectors.get(&handle)
    }

    /// The framebuffer arena
    pub fn framebuffers(&self) -> &Framebuffers {
        &self.framebuffers
    }

    /// Mutable access to the framebuffer arena, needed to render into output layers
    pub fn framebuffers_mut(&mut self) -> &mut Framebuffers {
        &mut self.framebuffers
    }

    /// Maximum size of cursor plane buffers
    pub fn cursor_size(&self) -> Size<u32, Physical> {
        self.cursor_size
    }

    /// Settle the property caches of every object touched by `commit`
    pub(crate) fn finish_commit(&mut self, commit: &AtomicCommit, success: bool) {
        for id in commit.objects() {
            let object = match id {
                ObjectId::Crtc(h) => self.crtcs.get_mut(&h).map(|c| c.object_mut()),
                ObjectId::Plane(h) => self.planes.get_mut(&h).map(|p| p.object_mut()),
                ObjectId::Connector(h) => self.connectors.get_mut(&h).map(|c| c.object_mut()),
            };
            match object {
                Some(object) if success => object.commit_succeeded(),
                Some(object) => object.commit_failed(),
                None => {}
            }
        }
    }

    /// Destroy kernel framebuffers nobody references anymore
    pub(crate) fn collect_garbage<D: KmsDevice + ?Sized>(&mut self, device: &D) {
        for fb in self.framebuffers.take_released() {
            if let Err(err) = device.destroy_framebuffer(fb) {
                warn!(?fb, ?err, "failed to destroy framebuffer");
            }
        }
    }

    /// Re-read a connector, adding it if it is new
    ///
    /// Returns whether its mode list changed.
    pub(crate) fn update_connector<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        handle: connector::Handle,
    ) -> Result<bool, Error> {
        match self.connectors.get_mut(&handle) {
            Some(connector) => connector.update(device),
            None => {
                self.connectors.insert(handle, Connector::new(device, handle)?);
                Ok(true)
            }
        }
    }

    /// Disable every connector, plane and crtc in one commit
    ///
    /// Used to start from a known state, regardless of what the previous drm master left on.
    pub fn reset_state<D: KmsDevice + ?Sized>(&mut self, device: &D) -> Result<(), Error> {
        let mut commit = AtomicCommit::new();
        let result = (|| {
            for connector in self.connectors.values_mut() {
                connector.disable(&mut commit)?;
            }
            for plane in self.planes.values_mut() {
                plane.disable(&mut commit)?;
            }
            for crtc in self.crtcs.values_mut() {
                crtc.disable(&mut commit)?;
            }
            device
                .atomic_commit(commit.flags(CommitMode::CommitWithoutEvent), &commit)
                .map_err(access("Failed to disable connectors", device.dev_path()))
        })();
        self.finish_commit(&commit, result.is_ok());
        result
    }
}

/// One drm device and the outputs of its connectors
#[derive(Debug)]
pub struct DrmGpu<D: KmsDevice> {
    id: GpuId,
    device: D,
    kms: KmsObjects,
    outputs: IndexMap<connector::Handle, DrmOutput>,
    scanner: ConnectorScanner,
    config: DrmBackendConfig,
    span: tracing::Span,
}

impl<D: KmsDevice> DrmGpu<D> {
    /// Take over a device
    ///
    /// No outputs exist until [`DrmGpu::scan_connectors`] is called.
    pub fn new(id: GpuId, device: D, config: &DrmBackendConfig) -> Result<DrmGpu<D>, Error> {
        let span = info_span!("drm_gpu", gpu = id.0, path = ?device.dev_path());
        let _guard = span.enter();

        let mut kms = KmsObjects::scan(&device)?;
        info!(
            crtcs = kms.crtcs.len(),
            planes = kms.planes.len(),
            connectors = kms.connectors.len(),
            "gpu added"
        );
        if config.disable_connectors_on_init {
            info!("resetting drm device state");
            kms.reset_state(&device)?;
        }

        drop(_guard);
        Ok(DrmGpu {
            id,
            device,
            kms,
            outputs: IndexMap::new(),
            scanner: ConnectorScanner::new(),
            config: config.clone(),
            span,
        })
    }

    /// Identifier of this gpu
    pub fn id(&self) -> GpuId {
        self.id
    }

    /// The underlying device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Kernel objects of this device
    pub fn kms(&self) -> &KmsObjects {
        &self.kms
    }

    /// Outputs of this gpu
    pub fn outputs(&self) -> impl Iterator<Item = &DrmOutput> {
        self.outputs.values()
    }

    /// The output of a connector
    pub fn output(&self, connector: connector::Handle) -> Option<&DrmOutput> {
        self.outputs.get(&connector)
    }

    fn output_id(&self, connector: connector::Handle) -> OutputId {
        OutputId {
            gpu: self.id,
            connector,
        }
    }

    /// Run `f` with an output and the objects it needs
    pub fn with_output<R>(
        &mut self,
        connector: connector::Handle,
        f: impl FnOnce(&mut DrmOutput, &D, &mut KmsObjects) -> R,
    ) -> Option<R> {
        let output = self.outputs.get_mut(&connector)?;
        Some(f(output, &self.device, &mut self.kms))
    }

    /// Diff the connectors against the last scan
    ///
    /// Creates outputs for new monitors, removes outputs of unplugged ones and
    /// re-validates the modes of the others.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn scan_connectors(&mut self) -> Result<Vec<OutputEvent>, Error> {
        let result = self
            .scanner
            .scan(&self.device)
            .map_err(access("Error scanning connectors", self.device.dev_path()))?;
        let mut events = Vec::new();

        // others may have touched the crtcs while we were not looking
        for crtc in self.kms.crtcs.values_mut() {
            if let Err(err) = crtc.update_properties(&self.device) {
                warn!(crtc = ?crtc.handle(), ?err, "failed to re-read crtc properties");
            }
        }

        for info in result.disconnected {
            if let Some(mut output) = self.outputs.shift_remove(&info.handle) {
                info!(output = output.name(), "connector disconnected");
                output.connector_lost(&self.device, &mut self.kms);
                events.push(OutputEvent::Removed(self.output_id(info.handle)));
            }
            if self.kms.update_connector(&self.device, info.handle).is_err() {
                debug!(connector = ?info.handle, "connector vanished");
                self.kms.connectors.shift_remove(&info.handle);
            }
        }

        for (handle, output) in self.outputs.iter_mut() {
            match self.kms.update_connector(&self.device, *handle) {
                Ok(true) => {
                    let id = OutputId {
                        gpu: self.id,
                        connector: *handle,
                    };
                    events.push(OutputEvent::ModesChanged(id));
                    if let Err(err) = output.update_modes(&self.device, &mut self.kms) {
                        warn!(output = output.name(), ?err, "failed to adjust to new modes");
                        events.push(OutputEvent::CommitFailed { output: id });
                    }
                }
                Ok(false) => {}
                Err(err) => warn!(output = output.name(), ?err, "failed to re-read connector"),
            }
        }

        for info in result.connected {
            if info.non_desktop {
                info!(connector = %info.name, "skipping non-desktop connector");
                continue;
            }
            if let Err(err) = self.kms.update_connector(&self.device, info.handle) {
                warn!(connector = %info.name, ?err, "failed to read connector");
                continue;
            }
            match DrmOutput::new(&self.device, &mut self.kms, info.handle, &self.config) {
                Ok(output) => {
                    info!(output = output.name(), "connector connected");
                    self.outputs.insert(info.handle, output);
                    events.push(OutputEvent::Added(self.output_id(info.handle)));
                }
                Err(err) => warn!(connector = %info.name, ?err, "failed to create output"),
            }
        }

        self.kms.collect_garbage(&self.device);
        Ok(events)
    }

    /// Route a page-flip to the output driven by `crtc`
    pub fn on_page_flip(&mut self, crtc: crtc::Handle, metadata: EventMetadata) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        let Some(connector) = self.kms.mapper.connector_for_crtc(&crtc) else {
            trace!(parent: &self.span, ?crtc, "page-flip for an unused crtc");
            return events;
        };
        let id = self.output_id(connector);
        let Some(outcome) = self
            .outputs
            .get_mut(&connector)
            .and_then(|output| output.page_flipped(&self.device, &mut self.kms, crtc))
        else {
            return events;
        };
        trace!(parent: &self.span, ?crtc, sequence = metadata.sequence, kind = ?outcome.kind, "page-flip");

        if matches!(outcome.kind, CommitKind::Present | CommitKind::Modeset) {
            events.push(OutputEvent::Presented {
                output: id,
                sequence: metadata.sequence,
                time: metadata.time,
            });
        }
        if let Some(Err(err)) = outcome.deferred_apply {
            warn!(parent: &self.span, ?err, "deferred configuration change failed");
            events.push(OutputEvent::CommitFailed { output: id });
        }
        if let Some(mode) = outcome.dpms_changed {
            events.push(OutputEvent::DpmsChanged { output: id, mode });
        }
        events
    }

    /// Drain kernel events and route them
    pub fn dispatch_device_events(&mut self) -> Result<Vec<OutputEvent>, Error> {
        let flips = self
            .device
            .receive_events()
            .map_err(access("Error reading drm events", self.device.dev_path()))?;
        let mut events = Vec::new();
        for flip in flips {
            events.extend(self.on_page_flip(
                flip.crtc,
                EventMetadata {
                    time: flip.time,
                    sequence: flip.sequence,
                },
            ));
        }
        Ok(events)
    }

    /// Forget all kernel state of every output after the device went away
    pub fn device_lost(&mut self) -> Vec<OutputEvent> {
        warn!(parent: &self.span, "device lost");
        let mut events = Vec::new();
        for (handle, mut output) in self.outputs.drain(..) {
            output.device_lost(&mut self.kms);
            events.push(OutputEvent::Removed(OutputId {
                gpu: self.id,
                connector: handle,
            }));
        }
        self.kms.collect_garbage(&self.device);
        self.scanner = ConnectorScanner::new();
        events
    }

    /// Switch every output off and release all framebuffers
    pub fn teardown(&mut self) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        for (handle, mut output) in self.outputs.drain(..) {
            output.connector_lost(&self.device, &mut self.kms);
            events.push(OutputEvent::Removed(OutputId {
                gpu: self.id,
                connector: handle,
            }));
        }
        self.kms.collect_garbage(&self.device);
        info!(parent: &self.span, "gpu removed");
        events
    }
}
