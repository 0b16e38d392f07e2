//! The per-output commit state machine
//!
//! A [`DrmPipeline`] binds a connector to a crtc and its planes and keeps three
//! snapshots of the desired kernel state:
//!
//! - *active*: the last state the kernel acknowledged
//! - *queued*: a validated configuration that was not sent to the kernel yet
//! - *pending*: a state submitted in a commit whose page-flip did not arrive yet
//!
//! Every transition from *active* to a new state is expressed as a single atomic commit,
//! which is tested before it is submitted. A rejected commit leaves *active* and all
//! framebuffer slots untouched. Only one commit per pipeline may be in flight;
//! applying while one is pending only records the request, it is retried once the
//! page-flip arrives.

use drm::control::{connector, crtc, plane, Mode};
use tracing::{debug, info, info_span, instrument, trace, warn};

use super::{
    color::{ColorTransform, GammaRamp},
    commit::{AtomicCommit, CommitMode},
    device::KmsDevice,
    error::Error,
    framebuffer::{FramebufferId, Framebuffers},
    gpu::KmsObjects,
    object::ObjectId,
    plane::{Plane, PlaneConfig},
};
use crate::utils::{Logical, Physical, Point, Rectangle, Size, Transform};

bitflags::bitflags! {
    /// Aspects in which two [`PipelineState`]s differ
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ChangeFlags: u32 {
        /// Output got enabled or disabled
        const ENABLE = 1 << 0;
        /// Power state changed
        const ACTIVE = 1 << 1;
        /// Mode changed
        const MODE = 1 << 2;
        /// Variable refresh rate changed
        const VRR = 1 << 3;
        /// Gamma lookup table changed
        const GAMMA = 1 << 4;
        /// Color transformation matrix changed
        const CTM = 1 << 5;
        /// Primary framebuffer changed
        const PRIMARY = 1 << 6;
        /// Output transform changed
        const TRANSFORM = 1 << 7;
        /// Cursor image or visibility changed
        const CURSOR_IMAGE = 1 << 8;
        /// Cursor moved
        const CURSOR_POSITION = 1 << 9;
        /// Logical position or scale changed, nothing the kernel knows about
        const LAYOUT = 1 << 10;
    }
}

impl ChangeFlags {
    /// Compute the difference between two states
    pub fn between(old: &PipelineState, new: &PipelineState) -> ChangeFlags {
        let mut flags = ChangeFlags::empty();
        flags.set(ChangeFlags::ENABLE, old.enabled != new.enabled);
        flags.set(ChangeFlags::ACTIVE, old.active != new.active);
        flags.set(ChangeFlags::MODE, old.mode != new.mode);
        flags.set(ChangeFlags::VRR, old.vrr != new.vrr);
        flags.set(ChangeFlags::GAMMA, old.gamma != new.gamma);
        flags.set(ChangeFlags::CTM, old.ctm != new.ctm);
        flags.set(ChangeFlags::PRIMARY, old.primary != new.primary);
        flags.set(ChangeFlags::TRANSFORM, old.transform != new.transform);
        flags.set(
            ChangeFlags::CURSOR_IMAGE,
            old.cursor.fb != new.cursor.fb
                || old.cursor.visible != new.cursor.visible
                || old.cursor.size != new.cursor.size,
        );
        flags.set(ChangeFlags::CURSOR_POSITION, old.cursor.position != new.cursor.position);
        flags.set(
            ChangeFlags::LAYOUT,
            old.position != new.position || old.scale != new.scale,
        );
        flags
    }

    /// Returns true if applying the change requires a modeset
    pub fn needs_modeset(&self) -> bool {
        self.intersects(ChangeFlags::ENABLE | ChangeFlags::ACTIVE | ChangeFlags::MODE)
    }
}

/// State of the cursor plane
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CursorState {
    /// Framebuffer holding the cursor image
    pub fb: Option<FramebufferId>,
    /// Top-left corner of the cursor plane on the crtc
    pub position: Point<i32, Physical>,
    /// Size of the cursor plane
    pub size: Size<u32, Physical>,
    /// Whether the cursor plane is shown
    pub visible: bool,
}

impl CursorState {
    /// A hidden cursor
    pub fn hidden() -> CursorState {
        CursorState::default()
    }
}

/// A complete desired state of a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineState {
    /// Output is enabled in the configuration
    pub enabled: bool,
    /// Output is powered (dpms on)
    pub active: bool,
    /// Mode to drive the connector with
    pub mode: Option<Mode>,
    /// Position in the global compositor space
    pub position: Point<i32, Logical>,
    /// Scale factor
    pub scale: f64,
    /// Output transform
    pub transform: Transform,
    /// Variable refresh rate
    pub vrr: bool,
    /// Gamma lookup table, `None` for linear
    pub gamma: Option<GammaRamp>,
    /// Color transformation, `None` for identity
    pub ctm: Option<ColorTransform>,
    /// Framebuffer of the primary plane
    pub primary: Option<FramebufferId>,
    /// Cursor plane state
    pub cursor: CursorState,
}

impl Default for PipelineState {
    fn default() -> Self {
        PipelineState {
            enabled: false,
            active: true,
            mode: None,
            position: (0, 0).into(),
            scale: 1.0,
            transform: Transform::Normal,
            vrr: false,
            gamma: None,
            ctm: None,
            primary: None,
            cursor: CursorState::hidden(),
        }
    }
}

impl PipelineState {
    /// Returns true if the state has the crtc scanning out
    pub fn is_scanning_out(&self) -> bool {
        self.enabled && self.active && self.mode.is_some()
    }
}

/// Why a commit was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    /// A configuration change
    Modeset,
    /// A new frame
    Present,
    /// A cursor update
    Cursor,
}

/// Result of [`DrmPipeline::apply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing was queued or the queued state equals the active one
    Unchanged,
    /// The new state is active, no page-flip is expected
    Committed,
    /// The commit was accepted, the state becomes active with the next page-flip
    Pending,
    /// A commit is in flight, the queued state is applied after its page-flip
    Deferred,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Blobs {
    mode: Option<u64>,
    gamma: Option<u64>,
    ctm: Option<u64>,
}

impl Blobs {
    fn destroy<D: KmsDevice + ?Sized>(self, device: &D) {
        for blob in [self.mode, self.gamma, self.ctm].into_iter().flatten() {
            if let Err(err) = device.destroy_blob(blob) {
                debug!(blob, ?err, "failed to destroy property blob");
            }
        }
    }
}

#[derive(Debug)]
struct PendingCommit {
    state: PipelineState,
    kind: CommitKind,
}

/// Connector, crtc and planes driven together through atomic commits
#[derive(Debug)]
pub struct DrmPipeline {
    connector: connector::Handle,
    crtc: Option<crtc::Handle>,
    active: PipelineState,
    queued: Option<PipelineState>,
    pending: Option<PendingCommit>,
    apply_requested: bool,
    blobs: Blobs,
    span: tracing::Span,
}

impl DrmPipeline {
    /// Create a pipeline for a connector
    ///
    /// If the kernel already drives the connector with an active crtc, that crtc is
    /// claimed and its mode becomes the active state.
    pub fn new<D: KmsDevice + ?Sized>(
        device: &D,
        kms: &mut KmsObjects,
        connector: connector::Handle,
    ) -> Result<DrmPipeline, Error> {
        let conn = kms.connectors.get(&connector).ok_or(Error::UnknownConnector)?;
        let span = info_span!("drm_pipeline", connector = conn.name());

        let mut active = PipelineState::default();
        let mut crtc = None;
        if let Some(current) = conn.current_crtc().filter(|_| conn.is_connected()) {
            if let Some(c) = kms.crtcs.get(&current).filter(|c| c.is_active()) {
                if let Some(mode) = c.query_current_mode(device)? {
                    let possible = kms.possible_crtcs(conn);
                    if kms.mapper.claim(connector, Some(current), &possible) == Some(current) {
                        span.in_scope(|| info!(crtc = ?current, ?mode, "adopting kernel state"));
                        crtc = Some(current);
                        active.enabled = true;
                        active.mode = Some(mode);
                        active.vrr = c.object().value("VRR_ENABLED") == Some(1);
                    }
                }
            }
        }

        Ok(DrmPipeline {
            connector,
            crtc,
            active,
            queued: None,
            pending: None,
            apply_requested: false,
            blobs: Blobs::default(),
            span,
        })
    }

    /// Connector driven by this pipeline
    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    /// Crtc currently bound to the connector
    pub fn crtc(&self) -> Option<crtc::Handle> {
        self.crtc
    }

    /// Last state acknowledged by the kernel
    pub fn active_state(&self) -> &PipelineState {
        &self.active
    }

    /// State queued but not yet submitted
    pub fn queued_state(&self) -> Option<&PipelineState> {
        self.queued.as_ref()
    }

    /// State submitted and awaiting its page-flip
    pub fn pending_state(&self) -> Option<&PipelineState> {
        self.pending.as_ref().map(|p| &p.state)
    }

    /// Returns true while a commit is in flight
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The state the pipeline is heading to: queued, else pending, else active
    pub fn next_state(&self) -> &PipelineState {
        self.queued
            .as_ref()
            .or(self.pending.as_ref().map(|p| &p.state))
            .unwrap_or(&self.active)
    }

    pub(crate) fn queued_mut(&mut self) -> Option<&mut PipelineState> {
        self.queued.as_mut()
    }

    /// Returns and resets whether an apply was deferred by a pending commit
    pub fn take_apply_request(&mut self) -> bool {
        std::mem::take(&mut self.apply_requested)
    }

    /// Returns true if a commit could be submitted right now
    pub fn can_commit(&self) -> bool {
        self.pending.is_none() && self.crtc.is_some() && self.active.is_scanning_out()
    }

    fn validate(&self, kms: &KmsObjects, state: &PipelineState) -> Result<(), Error> {
        let conn = kms.connectors.get(&self.connector).ok_or(Error::UnknownConnector)?;
        if !state.enabled {
            return Ok(());
        }
        if !conn.is_connected() {
            return Err(Error::ConnectorDisconnected);
        }
        let mode = state
            .mode
            .ok_or(Error::InvalidConfiguration("an enabled output needs a mode"))?;
        if !conn.supports_mode(&mode) {
            return Err(Error::ModeNotSuitable(mode));
        }
        if !(state.scale.is_finite() && state.scale > 0.0) {
            return Err(Error::InvalidConfiguration("scale must be finite and positive"));
        }

        let crtc = match self.crtc {
            Some(crtc) => crtc,
            None => kms
                .mapper
                .candidate(self.connector, conn.current_crtc(), &kms.possible_crtcs(conn))
                .ok_or(Error::NoSuitableCrtc)?,
        };
        let crtc = kms.crtcs.get(&crtc).ok_or(Error::UnknownCrtc)?;
        if state.vrr && !crtc.supports_vrr() {
            return Err(Error::InvalidConfiguration("variable refresh rate is not supported"));
        }
        if let Some(gamma) = &state.gamma {
            if gamma.size() != crtc.gamma_ramp_size() {
                return Err(Error::GammaSizeMismatch {
                    expected: crtc.gamma_ramp_size(),
                    got: gamma.size(),
                });
            }
        }
        if state.ctm.is_some() && !crtc.supports_ctm() {
            return Err(Error::InvalidConfiguration("color transformation is not supported"));
        }
        if state.transform != Transform::Normal {
            let rotates = kms
                .planes
                .get(&crtc.primary_plane())
                .map(|p| p.object().has_property("rotation"))
                .unwrap_or(false);
            if !rotates {
                return Err(Error::InvalidConfiguration("transform is not supported by the primary plane"));
            }
        }
        Ok(())
    }

    /// Validate and queue a new state
    ///
    /// Does not touch kernel state. On error the queued state is left as it was.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn queue_changes(&mut self, kms: &KmsObjects, state: PipelineState) -> Result<(), Error> {
        self.validate(kms, &state)?;
        debug!(enabled = state.enabled, active = state.active, mode = ?state.mode, "queued changes");
        self.queued = Some(state);
        Ok(())
    }

    /// Discard the queued state without submitting it
    pub fn revert_queued_changes(&mut self) {
        if self.queued.take().is_some() {
            debug!(parent: &self.span, "reverted queued changes");
        }
        self.apply_requested = false;
    }

    /// Submit the queued state as one atomic commit
    ///
    /// While a commit is pending this only records the request and returns
    /// [`ApplyOutcome::Deferred`]. On error the active state, the framebuffer slots
    /// and the queued state are unchanged.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn apply<D: KmsDevice + ?Sized>(&mut self, device: &D, kms: &mut KmsObjects) -> Result<ApplyOutcome, Error> {
        let Some(queued) = self.queued.clone() else {
            return Ok(ApplyOutcome::Unchanged);
        };
        if self.pending.is_some() {
            debug!("commit in flight, deferring");
            self.apply_requested = true;
            return Ok(ApplyOutcome::Deferred);
        }
        self.validate(kms, &queued)?;
        if queued == self.active {
            self.queued = None;
            return Ok(ApplyOutcome::Unchanged);
        }

        let mode_changed = queued.mode != self.active.mode;
        let outcome = self.commit_state(device, kms, queued, CommitKind::Modeset)?;
        if mode_changed {
            info!(mode = ?self.next_state().mode, "mode changed");
        }
        self.queued = None;
        Ok(outcome)
    }

    /// Submit a new primary framebuffer and cursor state, keeping everything else
    #[profiling::function]
    pub fn present<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        fb: FramebufferId,
        cursor: CursorState,
    ) -> Result<(), Error> {
        let crtc = self
            .crtc
            .filter(|_| self.active.is_scanning_out())
            .ok_or(Error::OutputDisabled)?;
        if self.pending.is_some() {
            return Err(Error::FlipPending(crtc));
        }
        let mut target = self.active.clone();
        target.primary = Some(fb);
        target.cursor = cursor;
        self.commit_state(device, kms, target, CommitKind::Present).map(|_| ())
    }

    /// Submit a cursor-only commit
    pub fn commit_cursor<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        cursor: CursorState,
    ) -> Result<(), Error> {
        let crtc = self
            .crtc
            .filter(|_| self.active.is_scanning_out())
            .ok_or(Error::OutputDisabled)?;
        if self.pending.is_some() {
            return Err(Error::FlipPending(crtc));
        }
        if self.active.cursor == cursor {
            return Ok(());
        }
        let mut target = self.active.clone();
        target.cursor = cursor;
        self.commit_state(device, kms, target, CommitKind::Cursor).map(|_| ())
    }

    /// Check whether the kernel would accept the cursor state, without changing anything
    pub fn test_cursor<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        cursor: &CursorState,
    ) -> Result<(), Error> {
        let crtc_handle = self.crtc.ok_or(Error::OutputDisabled)?;
        let cursor_plane = kms
            .crtcs
            .get(&crtc_handle)
            .ok_or(Error::UnknownCrtc)?
            .cursor_plane();
        let mut commit = AtomicCommit::new();
        let result = stage_cursor(
            &mut kms.planes,
            &kms.framebuffers,
            cursor_plane,
            crtc_handle,
            &self.next_state().cursor,
            cursor,
            true,
            &mut commit,
        )
        .and_then(|()| {
            device
                .atomic_commit(commit.flags(CommitMode::Test), &commit)
                .map_err(|_| Error::TestFailed(crtc_handle))
        });
        kms.finish_commit(&commit, false);
        result
    }

    fn commit_state<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        target: PipelineState,
        kind: CommitKind,
    ) -> Result<ApplyOutcome, Error> {
        let (crtc_handle, claimed) = match self.crtc {
            Some(crtc) => (crtc, false),
            None if target.is_scanning_out() => {
                let conn = kms.connectors.get(&self.connector).ok_or(Error::UnknownConnector)?;
                let possible = kms.possible_crtcs(conn);
                let restored = conn.current_crtc();
                let crtc = kms
                    .mapper
                    .claim(self.connector, restored, &possible)
                    .ok_or(Error::NoSuitableCrtc)?;
                (crtc, true)
            }
            None => {
                // no crtc and nothing to scan out, the kernel has nothing to know
                self.active = target;
                return Ok(ApplyOutcome::Committed);
            }
        };

        let mut commit = AtomicCommit::new();
        let mut created = Blobs::default();
        let result = self
            .build_commit(device, kms, crtc_handle, claimed, &target, &mut commit, &mut created)
            .and_then(|()| submit(device, crtc_handle, &target, &commit));

        if let Err(err) = result {
            warn!(parent: &self.span, ?err, ?kind, "commit failed, keeping previous state");
            kms.finish_commit(&commit, false);
            created.destroy(device);
            if claimed {
                kms.mapper.release(self.connector);
            }
            return Err(err);
        }

        kms.finish_commit(&commit, true);
        self.adopt_blobs(device, crtc_handle, &commit, created);
        if claimed {
            self.crtc = Some(crtc_handle);
        }

        if commit.is_empty() && target.is_scanning_out() {
            self.active = target;
            return Ok(ApplyOutcome::Committed);
        }

        let KmsObjects {
            crtcs,
            planes,
            framebuffers,
            ..
        } = &mut *kms;
        let crtc = crtcs.get_mut(&crtc_handle).ok_or(Error::UnknownCrtc)?;

        if target.is_scanning_out() {
            if let Some(fb) = target.primary.filter(|_| commit.touches(ObjectId::Plane(crtc.primary_plane()))) {
                if let Err(err) = crtc.set_next(framebuffers, fb) {
                    warn!(parent: &self.span, ?err, "primary framebuffer vanished");
                }
            }
            if let Some(cursor) = crtc.cursor_plane().and_then(|h| planes.get_mut(&h)) {
                let new_image = commit
                    .value(ObjectId::Plane(cursor.handle()), "FB_ID")
                    .filter(|fb| *fb != 0);
                if let (Some(_), Some(fb)) = (new_image, target.cursor.fb) {
                    if let Err(err) = cursor.buffers_mut().set_next(framebuffers, fb) {
                        warn!(parent: &self.span, ?err, "cursor framebuffer vanished");
                    }
                }
            }
            trace!(parent: &self.span, ?kind, "commit submitted, waiting for page-flip");
            self.pending = Some(PendingCommit { state: target, kind });
            Ok(ApplyOutcome::Pending)
        } else {
            crtc.release_buffers(framebuffers);
            if let Some(cursor) = crtc.cursor_plane().and_then(|h| planes.get_mut(&h)) {
                cursor.release_buffers(framebuffers);
            }
            if !target.enabled {
                kms.mapper.release(self.connector);
                self.crtc = None;
            }
            self.active = target;
            kms.collect_garbage(device);
            Ok(ApplyOutcome::Committed)
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[profiling::function]
    fn build_commit<D: KmsDevice + ?Sized>(
        &self,
        device: &D,
        kms: &mut KmsObjects,
        crtc_handle: crtc::Handle,
        claimed: bool,
        target: &PipelineState,
        commit: &mut AtomicCommit,
        created: &mut Blobs,
    ) -> Result<(), Error> {
        let flags = if claimed {
            ChangeFlags::all()
        } else {
            ChangeFlags::between(&self.active, target)
        };
        let modeset = flags.needs_modeset();

        let KmsObjects {
            crtcs,
            planes,
            connectors,
            framebuffers,
            ..
        } = kms;
        let crtc = crtcs.get_mut(&crtc_handle).ok_or(Error::UnknownCrtc)?;
        let connector = connectors.get_mut(&self.connector).ok_or(Error::UnknownConnector)?;
        let primary_handle = crtc.primary_plane();
        let cursor_handle = crtc.cursor_plane();

        if !target.enabled {
            if !modeset {
                return Ok(());
            }
            connector.disable(commit)?;
            crtc.disable(commit)?;
            planes.get_mut(&primary_handle).ok_or(Error::UnknownPlane)?.disable(commit)?;
            if let Some(cursor) = cursor_handle.and_then(|h| planes.get_mut(&h)) {
                cursor.disable(commit)?;
            }
            return Ok(());
        }

        let mode = target
            .mode
            .ok_or(Error::InvalidConfiguration("an enabled output needs a mode"))?;

        // a powered off crtc keeps its mode and color state, the kernel must always
        // hold what `active` records
        if flags.intersects(ChangeFlags::ENABLE | ChangeFlags::MODE) {
            let blob = device
                .create_mode_blob(&mode)
                .map_err(super::error::access("Failed to create mode blob", device.dev_path()))?;
            created.mode = Some(blob);
            crtc.set_mode(commit, blob, target.active)?;
            connector.bind(commit, crtc_handle)?;
        } else if flags.contains(ChangeFlags::ACTIVE) {
            crtc.object_mut().stage(commit, "ACTIVE", target.active as u64)?;
            commit.set_modeset();
        }

        if flags.contains(ChangeFlags::VRR) || modeset {
            crtc.set_vrr(commit, target.vrr)?;
        }
        if flags.contains(ChangeFlags::GAMMA) {
            let blob = match target.gamma.as_ref().filter(|g| !g.is_identity()) {
                Some(ramp) => {
                    let blob = device
                        .create_blob(&ramp.to_blob_data())
                        .map_err(super::error::access("Failed to create gamma blob", device.dev_path()))?;
                    created.gamma = Some(blob);
                    blob
                }
                None => 0,
            };
            crtc.set_gamma(commit, blob)?;
        }
        if flags.contains(ChangeFlags::CTM) {
            let blob = match target.ctm.as_ref().filter(|c| !c.is_identity()) {
                Some(ctm) => {
                    let blob = device
                        .create_blob(&ctm.to_blob_data())
                        .map_err(super::error::access("Failed to create ctm blob", device.dev_path()))?;
                    created.ctm = Some(blob);
                    blob
                }
                None => 0,
            };
            crtc.set_ctm(commit, blob)?;
        }

        if !target.active {
            if flags.intersects(ChangeFlags::ENABLE | ChangeFlags::ACTIVE) {
                planes.get_mut(&primary_handle).ok_or(Error::UnknownPlane)?.disable(commit)?;
                if let Some(cursor) = cursor_handle.and_then(|h| planes.get_mut(&h)) {
                    cursor.disable(commit)?;
                }
            }
            return Ok(());
        }

        if modeset || flags.intersects(ChangeFlags::PRIMARY | ChangeFlags::TRANSFORM) {
            let fb_id = target
                .primary
                .ok_or(Error::InvalidConfiguration("no framebuffer to scan out"))?;
            let fb = framebuffers.get(fb_id).ok_or(Error::UnknownFramebuffer)?;
            let (w, h) = mode.size();
            let plane = planes.get_mut(&primary_handle).ok_or(Error::UnknownPlane)?;
            if !plane.supports_format(fb.format) {
                return Err(Error::InvalidConfiguration("primary plane does not support the format"));
            }
            plane.set(
                commit,
                crtc_handle,
                &PlaneConfig {
                    fb: fb.handle,
                    src: Rectangle::from_size(fb.size),
                    dst: Rectangle::from_size((w as i32, h as i32).into()),
                    transform: target.transform,
                },
            )?;
        }

        if modeset || flags.intersects(ChangeFlags::CURSOR_IMAGE | ChangeFlags::CURSOR_POSITION) {
            stage_cursor(
                planes,
                framebuffers,
                cursor_handle,
                crtc_handle,
                &self.active.cursor,
                &target.cursor,
                modeset || flags.contains(ChangeFlags::CURSOR_IMAGE),
                commit,
            )?;
        }

        Ok(())
    }

    fn adopt_blobs<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        crtc: crtc::Handle,
        commit: &AtomicCommit,
        created: Blobs,
    ) {
        let id = ObjectId::Crtc(crtc);
        let mut stale = Blobs::default();
        if commit.value(id, "MODE_ID").is_some() {
            stale.mode = std::mem::replace(&mut self.blobs.mode, created.mode);
        }
        if commit.value(id, "GAMMA_LUT").is_some() {
            stale.gamma = std::mem::replace(&mut self.blobs.gamma, created.gamma);
        }
        if commit.value(id, "CTM").is_some() {
            stale.ctm = std::mem::replace(&mut self.blobs.ctm, created.ctm);
        }
        // the kernel holds its own reference to blobs in use
        stale.destroy(device);
    }

    /// Handle the page-flip of the pending commit
    ///
    /// Promotes the pending state to active and flips the framebuffer slots.
    /// Returns `None` if the flip does not belong to this pipeline or nothing was pending.
    pub fn page_flipped<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        kms: &mut KmsObjects,
        crtc_handle: crtc::Handle,
    ) -> Option<CommitKind> {
        if self.crtc != Some(crtc_handle) {
            return None;
        }
        let pending = self.pending.take()?;

        let KmsObjects {
            crtcs,
            planes,
            framebuffers,
            ..
        } = &mut *kms;
        if let Some(crtc) = crtcs.get_mut(&crtc_handle) {
            crtc.flip_buffer(framebuffers);
            if let Some(cursor) = crtc.cursor_plane().and_then(|h| planes.get_mut(&h)) {
                if pending.state.cursor.visible {
                    cursor.buffers_mut().flip_buffer(framebuffers);
                } else {
                    cursor.release_buffers(framebuffers);
                }
            }
        }
        self.active = pending.state;
        kms.collect_garbage(device);
        trace!(parent: &self.span, kind = ?pending.kind, "page-flip completed");
        Some(pending.kind)
    }

    /// Forget all kernel state after the device or connector went away
    ///
    /// Pending and queued states are discarded, all framebuffer slots released and
    /// the pipeline ends up disabled.
    pub fn device_lost(&mut self, kms: &mut KmsObjects) {
        info!(parent: &self.span, "device lost, disabling pipeline");
        self.pending = None;
        self.queued = None;
        self.apply_requested = false;
        if let Some(crtc_handle) = self.crtc.take() {
            let KmsObjects {
                crtcs,
                planes,
                framebuffers,
                ..
            } = &mut *kms;
            if let Some(crtc) = crtcs.get_mut(&crtc_handle) {
                crtc.release_buffers(framebuffers);
                if let Some(cursor) = crtc.cursor_plane().and_then(|h| planes.get_mut(&h)) {
                    cursor.release_buffers(framebuffers);
                }
            }
        }
        kms.mapper.release(self.connector);
        self.active = PipelineState::default();
        self.blobs = Blobs::default();
    }
}

fn submit<D: KmsDevice + ?Sized>(
    device: &D,
    crtc: crtc::Handle,
    target: &PipelineState,
    commit: &AtomicCommit,
) -> Result<(), Error> {
    if commit.is_empty() {
        return Ok(());
    }
    debug!(writes = commit.len(), modeset = commit.requires_modeset(), "testing commit");
    for write in commit.writes() {
        trace!(object = ?write.object, property = write.name, value = write.value);
    }
    device
        .atomic_commit(commit.flags(CommitMode::Test), commit)
        .map_err(|err| {
            warn!(?err, "atomic test failed");
            if matches!(err.raw_os_error(), Some(libc::ENODEV)) {
                Error::ObjectGone
            } else {
                Error::TestFailed(crtc)
            }
        })?;

    let mode = if target.is_scanning_out() {
        CommitMode::Commit
    } else {
        CommitMode::CommitWithoutEvent
    };
    device
        .atomic_commit(commit.flags(mode), commit)
        .map_err(|source| Error::CommitRejected { crtc, source })
}

#[allow(clippy::too_many_arguments)]
fn stage_cursor(
    planes: &mut indexmap::IndexMap<plane::Handle, Plane>,
    framebuffers: &Framebuffers,
    cursor_plane: Option<plane::Handle>,
    crtc: crtc::Handle,
    old: &CursorState,
    new: &CursorState,
    full: bool,
    commit: &mut AtomicCommit,
) -> Result<(), Error> {
    let Some(handle) = cursor_plane else {
        return if new.visible {
            Err(Error::UnknownPlane)
        } else {
            Ok(())
        };
    };
    let plane = planes.get_mut(&handle).ok_or(Error::UnknownPlane)?;

    match new.fb.filter(|_| new.visible) {
        Some(_) if !full && old.visible && old.fb == new.fb && old.size == new.size => {
            plane.set_position(commit, new.position)
        }
        Some(fb_id) => {
            let fb = framebuffers.get(fb_id).ok_or(Error::UnknownFramebuffer)?;
            if !plane.supports_format(fb.format) {
                return Err(Error::InvalidConfiguration("cursor plane does not support the format"));
            }
            plane.set(
                commit,
                crtc,
                &PlaneConfig {
                    fb: fb.handle,
                    src: Rectangle::from_size(new.size),
                    dst: Rectangle::new(new.position, (new.size.w as i32, new.size.h as i32).into()),
                    transform: Transform::Normal,
                },
            )
        }
        None if old.visible || full => plane.disable(commit),
        None => Ok(()),
    }
}
