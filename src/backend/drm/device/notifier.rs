use std::io;

use calloop::{
    generic::Generic, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory,
};
use tracing::{error, trace};

use super::{fd::DrmDeviceFd, KmsDevice};
use crate::backend::drm::{error::AccessError, DrmEvent, Error, EventMetadata};

/// Event source for page-flip events of a drm device
///
/// Insert it into a calloop event loop and forward [`DrmEvent::VBlank`] events together
/// with their [`EventMetadata`] to [`DrmBackend::on_page_flip`](crate::backend::drm::DrmBackend::on_page_flip).
#[derive(Debug)]
pub struct DrmDeviceNotifier {
    device: DrmDeviceFd,
    source: Generic<DrmDeviceFd>,
}

impl DrmDeviceNotifier {
    /// Create a notifier reading events of the given device
    pub fn new(device: DrmDeviceFd) -> DrmDeviceNotifier {
        DrmDeviceNotifier {
            source: Generic::new(device.clone(), Interest::READ, Mode::Level),
            device,
        }
    }
}

impl EventSource for DrmDeviceNotifier {
    type Event = DrmEvent;
    type Metadata = Option<EventMetadata>;
    type Ret = ();
    type Error = io::Error;

    #[profiling::function]
    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let device = &self.device;
        self.source.process_events(readiness, token, |_, _| {
            match KmsDevice::receive_events(device) {
                Ok(flips) => {
                    for flip in flips {
                        trace!(crtc = ?flip.crtc, sequence = flip.sequence, "page-flip");
                        callback(
                            DrmEvent::VBlank(flip.crtc),
                            &mut Some(EventMetadata {
                                time: flip.time,
                                sequence: flip.sequence,
                            }),
                        );
                    }
                }
                Err(source) => {
                    let dev = KmsDevice::dev_path(device);
                    error!(?dev, "Error processing drm events: {}", source);
                    callback(
                        DrmEvent::Error(Error::Access(AccessError {
                            errmsg: "Error processing drm events",
                            dev,
                            source,
                        })),
                        &mut None,
                    );
                }
            }
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)
    }
}
