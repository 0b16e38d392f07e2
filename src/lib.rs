#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # atomic-kms: display outputs through atomic kernel modesetting
//!
//! This crate manages the output side of a compositor on Linux: it discovers the
//! connectors of one or more gpus, binds them to crtcs and planes, and turns
//! output configurations, frames and cursor updates into atomic commits.
//!
//! ## Structure of the crate
//!
//! - [`backend::drm`] contains the modesetting pipeline, from the kernel device up to the
//!   [`DrmBackend`](backend::drm::DrmBackend) managing all outputs.
//! - [`config`] contains the tunables of the backend, which can be read from the environment.
//! - [`utils`] contains geometry types shared by the other modules.
//!
//! ## General principles
//!
//! ### The event loop
//!
//! The backend is built to be driven by [`calloop`]. Output events are delivered through a
//! [`calloop::channel::Channel`] returned by
//! [`DrmBackend::new`](backend::drm::DrmBackend::new), page-flip events of real devices are
//! read by a [`DrmDeviceNotifier`](backend::drm::DrmDeviceNotifier) event source. None of
//! the types are shared across threads, all calls are expected from the thread running the
//! event loop.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```
//!
//! If you do not want to use [`tracing`] for your compositor, refer to [`log compatibility`](tracing#log-compatibility)
//! for how to forward messages to the [`log`](https://docs.rs/log) crate.

pub mod backend;
pub mod config;
pub mod utils;
