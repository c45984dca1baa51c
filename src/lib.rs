//! AVA (Animated Avatar Augmenter).
//!
//! Companion-asset resolution and opportunistic upgrade of static chat
//! avatars: given an avatar image reference, derive the plausible animated
//! companion URLs, probe them cheaply, and swap the displayed element for
//! the animated asset. The upload path is intercepted so a user-picked video
//! is reduced to a PNG still for the host's save flow while the animated
//! companion is converted and uploaded alongside.
//!
//! The host application is reached only through explicit seams: a mirrored
//! page tree, a capability registry, and channel-delivered lifecycle
//! signals. See `runtime::Runtime` for the wiring entry point.

use std::future::Future;
use std::pin::Pin;

pub mod avatar_ref;
pub mod capabilities;
pub mod frame;
pub mod page;
pub mod resolver;
pub mod runtime;
pub mod settings;
pub mod shims;
#[cfg(feature = "sidecar_ffmpeg")]
pub mod sidecar;
pub mod upgrade;
pub mod upload;
pub mod uploader;
pub mod watcher;

/// Boxed single-threaded future: the await shape used across host seams.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;
