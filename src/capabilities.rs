//! Host capability seams.
//!
//! The host application exposes a handful of functions and constructs the
//! augmenter must cooperate with (or route around). Rather than reaching into
//! host globals, the host adapter registers each capability here; wrappers
//! installed by this crate (see `shims`) are re-applied automatically when the
//! host replaces a binding, and a marker keeps every slot at exactly one
//! wrapping layer.

use std::rc::Rc;

use anyhow::Result;

use crate::frame::StillFrame;
use crate::page::{FileSelection, NodeId};
use crate::LocalBoxFuture;

/// Fallback avatar the host ships for failed/empty previews.
pub const DEFAULT_AVATAR_PATH: &str = "/img/ai4.png";

/// The host's image-format normalization function: called on a picked file
/// before submission, returns the file the host will actually save.
pub trait ImageNormalizer {
    fn normalize<'a>(&'a self, file: &'a FileSelection)
        -> LocalBoxFuture<'a, Result<FileSelection>>;

    /// Marker distinguishing this crate's wrapper from host implementations.
    fn is_shim(&self) -> bool {
        false
    }

    /// Wrappers forward re-registrations to the current host implementation.
    fn replace_delegate(&self, _delegate: Rc<dyn ImageNormalizer>) {}
}

/// Extracts a representative still frame from a video payload (seeking a
/// little way in so the frame is unlikely to be black).
pub trait FrameExtractor {
    fn extract_still<'a>(&'a self, file: &'a FileSelection) -> LocalBoxFuture<'a, Result<StillFrame>>;
}

/// Converts a video payload into an animated webp. Injected by an external
/// add-on; frequently absent.
pub trait VideoConverter {
    fn convert<'a>(&'a self, file: &'a FileSelection) -> LocalBoxFuture<'a, Result<Vec<u8>>>;
}

/// Opens the host's third-party extension installer for a given repo URL.
pub trait ExtensionMenu {
    fn open(&self, url: &str);
}

/// Re-dispatches a change event on an upload control so the host's own
/// (bubbling) handlers run against the control's current payload.
pub trait ChangeDispatcher {
    fn dispatch_change(&self, input: NodeId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Warning,
    Success,
    Error,
}

/// Display options for a toast. `sticky` keeps the toast up until dismissed
/// (the host's zero-timeout mode); `on_click` runs when the user clicks it.
#[derive(Clone, Default)]
pub struct ToastOptions {
    pub sticky: bool,
    pub on_click: Option<Rc<dyn Fn()>>,
}

impl ToastOptions {
    pub fn sticky() -> Self {
        Self {
            sticky: true,
            on_click: None,
        }
    }

    pub fn sticky_with_click(on_click: Rc<dyn Fn()>) -> Self {
        Self {
            sticky: true,
            on_click: Some(on_click),
        }
    }
}

/// Handle to a displayed toast; dropping it leaves the toast up.
pub struct ToastHandle {
    dismiss: Option<Box<dyn FnOnce()>>,
}

impl ToastHandle {
    pub fn detached() -> Self {
        Self { dismiss: None }
    }

    pub fn with_dismiss(dismiss: Box<dyn FnOnce()>) -> Self {
        Self {
            dismiss: Some(dismiss),
        }
    }

    pub fn dismiss(mut self) {
        if let Some(dismiss) = self.dismiss.take() {
            dismiss();
        }
    }
}

/// The host's notification-toast API.
pub trait ToastSink {
    fn show(
        &self,
        level: ToastLevel,
        message: &str,
        title: Option<&str>,
        options: ToastOptions,
    ) -> ToastHandle;

    fn info(&self, message: &str, title: Option<&str>, options: ToastOptions) -> ToastHandle {
        self.show(ToastLevel::Info, message, title, options)
    }

    fn warning(&self, message: &str, title: Option<&str>, options: ToastOptions) -> ToastHandle {
        self.show(ToastLevel::Warning, message, title, options)
    }

    fn success(&self, message: &str, title: Option<&str>, options: ToastOptions) -> ToastHandle {
        self.show(ToastLevel::Success, message, title, options)
    }

    fn error(&self, message: &str, title: Option<&str>, options: ToastOptions) -> ToastHandle {
        self.show(ToastLevel::Error, message, title, options)
    }
}

/// Symbolic purpose tags for host modals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalPurpose {
    Text,
    Confirm,
    Input,
    Crop,
}

/// Result codes passed to [`ModalDelegate::complete`]. Anything at or above
/// [`RESULT_AFFIRMATIVE`] counts as confirmation.
pub const RESULT_AFFIRMATIVE: i32 = 1;
pub const RESULT_NEGATIVE: i32 = 0;

/// The cropping library's state object: a canvas-producing accessor.
pub trait CropperState {
    fn cropped_canvas(&self) -> Option<StillFrame>;
}

/// Contract of the host's modal construct, as this crate needs to compose
/// with it. `show` resolves to the modal's produced value (an image source
/// for crop modals); `complete` finalizes with a result code.
pub trait ModalDelegate {
    fn purpose(&self) -> ModalPurpose;

    /// The image element being cropped, when this is a crop modal.
    fn crop_target(&self) -> Option<NodeId>;

    fn cropper(&self) -> Option<Rc<dyn CropperState>>;

    fn install_cropper(&self, state: Rc<dyn CropperState>);

    fn show<'a>(&'a self) -> LocalBoxFuture<'a, Result<Option<String>>>;

    fn complete<'a>(&'a self, result: i32) -> LocalBoxFuture<'a, Result<()>>;
}

/// Produces modal instances. The host registers its factory here; the guard
/// installed by this crate wraps every produced modal.
pub trait ModalFactory {
    fn create(&self, purpose: ModalPurpose, crop_target: Option<NodeId>) -> Rc<dyn ModalDelegate>;

    fn is_guard(&self) -> bool {
        false
    }

    fn replace_delegate(&self, _delegate: Rc<dyn ModalFactory>) {}
}

/// Table of named host capabilities. Function-valued slots carry an optional
/// wrapper installed by this crate; `register_*` keeps the wrapper in front
/// no matter how often the host re-registers, and re-registering a wrapper
/// itself is ignored so a slot never gains a second layer.
#[derive(Default)]
pub struct CapabilityRegistry {
    normalizer_raw: Option<Rc<dyn ImageNormalizer>>,
    normalizer_shim: Option<Rc<dyn ImageNormalizer>>,
    modal_factory_raw: Option<Rc<dyn ModalFactory>>,
    modal_factory_guard: Option<Rc<dyn ModalFactory>>,
    converter: Option<Rc<dyn VideoConverter>>,
    frame_extractor: Option<Rc<dyn FrameExtractor>>,
    toasts: Option<Rc<dyn ToastSink>>,
    extension_menu: Option<Rc<dyn ExtensionMenu>>,
    change_dispatcher: Option<Rc<dyn ChangeDispatcher>>,
    default_avatar: Option<String>,
    csrf_token: Option<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) the host's normalization function. The shim
    /// layer, once installed, stays in front.
    pub fn register_normalizer(&mut self, normalizer: Rc<dyn ImageNormalizer>) {
        if normalizer.is_shim() {
            return;
        }
        if let Some(shim) = &self.normalizer_shim {
            shim.replace_delegate(normalizer.clone());
        }
        self.normalizer_raw = Some(normalizer);
    }

    /// Install this crate's normalization wrapper. Idempotent: a second
    /// install leaves the existing single layer untouched.
    pub fn install_normalizer_shim(&mut self, shim: Rc<dyn ImageNormalizer>) {
        if self.normalizer_shim.is_some() || !shim.is_shim() {
            return;
        }
        if let Some(raw) = &self.normalizer_raw {
            shim.replace_delegate(raw.clone());
        }
        self.normalizer_shim = Some(shim);
    }

    pub fn normalizer(&self) -> Option<Rc<dyn ImageNormalizer>> {
        self.normalizer_shim
            .clone()
            .or_else(|| self.normalizer_raw.clone())
    }

    pub fn register_modal_factory(&mut self, factory: Rc<dyn ModalFactory>) {
        if factory.is_guard() {
            return;
        }
        if let Some(guard) = &self.modal_factory_guard {
            guard.replace_delegate(factory.clone());
        }
        self.modal_factory_raw = Some(factory);
    }

    pub fn install_modal_guard(&mut self, guard: Rc<dyn ModalFactory>) {
        if self.modal_factory_guard.is_some() || !guard.is_guard() {
            return;
        }
        if let Some(raw) = &self.modal_factory_raw {
            guard.replace_delegate(raw.clone());
        }
        self.modal_factory_guard = Some(guard);
    }

    pub fn modal_factory(&self) -> Option<Rc<dyn ModalFactory>> {
        self.modal_factory_guard
            .clone()
            .or_else(|| self.modal_factory_raw.clone())
    }

    pub fn has_modal_factory(&self) -> bool {
        self.modal_factory_raw.is_some()
    }

    pub fn register_converter(&mut self, converter: Rc<dyn VideoConverter>) {
        self.converter = Some(converter);
    }

    pub fn converter(&self) -> Option<Rc<dyn VideoConverter>> {
        self.converter.clone()
    }

    pub fn register_frame_extractor(&mut self, extractor: Rc<dyn FrameExtractor>) {
        self.frame_extractor = Some(extractor);
    }

    pub fn frame_extractor(&self) -> Option<Rc<dyn FrameExtractor>> {
        self.frame_extractor.clone()
    }

    pub fn register_toasts(&mut self, toasts: Rc<dyn ToastSink>) {
        self.toasts = Some(toasts);
    }

    pub fn toasts(&self) -> Option<Rc<dyn ToastSink>> {
        self.toasts.clone()
    }

    pub fn register_extension_menu(&mut self, menu: Rc<dyn ExtensionMenu>) {
        self.extension_menu = Some(menu);
    }

    pub fn extension_menu(&self) -> Option<Rc<dyn ExtensionMenu>> {
        self.extension_menu.clone()
    }

    pub fn register_change_dispatcher(&mut self, dispatcher: Rc<dyn ChangeDispatcher>) {
        self.change_dispatcher = Some(dispatcher);
    }

    pub fn change_dispatcher(&self) -> Option<Rc<dyn ChangeDispatcher>> {
        self.change_dispatcher.clone()
    }

    pub fn set_default_avatar(&mut self, path: &str) {
        self.default_avatar = Some(path.to_owned());
    }

    pub fn default_avatar(&self) -> String {
        self.default_avatar
            .clone()
            .unwrap_or_else(|| DEFAULT_AVATAR_PATH.to_owned())
    }

    pub fn set_csrf_token(&mut self, token: &str) {
        self.csrf_token = Some(token.to_owned());
    }

    pub fn csrf_token(&self) -> Option<String> {
        self.csrf_token.clone()
    }
}
