use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use anyhow::{Context, Result};

use crate::avatar_ref::{has_video_extension, strip_extension};
use crate::capabilities::{CapabilityRegistry, ToastOptions};
use crate::frame::png_data_url;
use crate::page::{FileSelection, NodeId, PageTree, SharedTree};
use crate::uploader::CompanionSink;

/// Preview image the host shows next to the avatar form.
pub const PREVIEW_ELEMENT_ID: &str = "avatar_load_preview";
/// Hidden field carrying the currently edited character's avatar file name.
pub const CHARACTER_NAME_FIELD_ID: &str = "avatar_url_pole";
/// Marker set around a synthetic change re-dispatch after conversion.
pub const CONVERTED_ATTR: &str = "data-avatar-converted";

/// Install page for the external video converter add-on.
const CONVERTER_ADDON_URL: &str =
    "https://github.com/SillyTavern/Extension-VideoBackgroundLoader";

/// The upload controls this system recognizes, by host element identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadControl {
    CharacterAvatar,
    GroupAvatar,
    PersonaAvatar,
}

/// Identify a recognized avatar upload control.
pub fn control_role(tree: &PageTree, id: NodeId) -> Option<UploadControl> {
    if tree.tag(id) != Some("input") {
        return None;
    }
    match tree.attribute(id, "id") {
        Some("add_avatar_button") => Some(UploadControl::CharacterAvatar),
        Some("group_avatar_button") => Some(UploadControl::GroupAvatar),
        Some("avatar_upload_file") => Some(UploadControl::PersonaAvatar),
        _ => tree
            .class_list(id)
            .iter()
            .any(|class| class == "avatarUpload")
            .then_some(UploadControl::PersonaAvatar),
    }
}

/// Widen the accept filter on every recognized upload control under `root`
/// so the host's file picker offers video files too.
pub fn widen_upload_accept(tree: &mut PageTree, root: NodeId) {
    for id in tree.subtree(root) {
        if control_role(tree, id).is_none() {
            continue;
        }
        let accept = tree.attribute(id, "accept").unwrap_or("").to_owned();
        if accept.contains("video/*") {
            continue;
        }
        let widened = if accept.is_empty() {
            "image/*,video/*".to_owned()
        } else {
            format!("{accept},video/*")
        };
        tree.set_attribute(id, "accept", &widened);
    }
}

/// Video classification: declared media type prefix or recognized extension.
pub fn is_video_file(name: &str, media_type: &str) -> bool {
    media_type.to_ascii_lowercase().starts_with("video/") || has_video_extension(name)
}

/// The edited character's avatar base name, read from the host's hidden name
/// field. Empty or absent during character creation.
pub fn character_base_name(tree: &PageTree) -> Option<String> {
    let field = tree.element_by_id(CHARACTER_NAME_FIELD_ID)?;
    let value = tree.attribute(field, "value")?.trim();
    if value.is_empty() {
        return None;
    }
    if value.to_ascii_lowercase().ends_with(".png") {
        Some(value[..value.len() - 4].to_owned())
    } else {
        Some(value.to_owned())
    }
}

/// Metadata of the most recent selection, kept for the modal guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFileMeta {
    pub name: String,
    pub media_type: String,
    pub size: usize,
}

impl SelectedFileMeta {
    pub fn of(file: &FileSelection) -> Self {
        Self {
            name: file.name.clone(),
            media_type: file.media_type.clone(),
            size: file.size(),
        }
    }

    pub fn is_video(&self) -> bool {
        is_video_file(&self.name, &self.media_type)
    }
}

/// Transient interception state: the last selection seen, the one-time
/// converter advisory, and the per-input in-progress flags that collapse the
/// change/input double fire into a single conversion run.
#[derive(Debug, Default)]
pub struct UploadState {
    last_selected: Option<SelectedFileMeta>,
    advisory_shown: bool,
    converting: HashSet<NodeId>,
}

pub type SharedUploadState = Rc<RefCell<UploadState>>;

impl UploadState {
    pub fn record_selection(&mut self, file: &FileSelection) {
        self.last_selected = Some(SelectedFileMeta::of(file));
    }

    pub fn last_selected(&self) -> Option<&SelectedFileMeta> {
        self.last_selected.as_ref()
    }

    pub fn last_selected_is_video(&self) -> bool {
        self.last_selected
            .as_ref()
            .map(SelectedFileMeta::is_video)
            .unwrap_or(false)
    }

    /// Claim the conversion slot for `input`. Returns false when a run is
    /// already in flight, in which case the caller must drop its trigger.
    pub fn begin_conversion(&mut self, input: NodeId) -> bool {
        self.converting.insert(input)
    }

    pub fn conversion_in_flight(&self, input: NodeId) -> bool {
        self.converting.contains(&input)
    }

    pub fn finish_conversion(&mut self, input: NodeId) {
        self.converting.remove(&input);
    }

    /// Whether the converter-missing advisory already fired this session.
    /// Marks it fired either way.
    pub fn advisory_already_shown(&mut self) -> bool {
        std::mem::replace(&mut self.advisory_shown, true)
    }
}

/// What the host adapter should do with the intercepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Not ours: let the host's own handlers run.
    PassThrough,
    /// A video selection: the host's handlers must not see this event.
    Suppressed,
}

/// Capture-phase interceptor for file-selection events on avatar upload
/// controls. Classification is synchronous so the disposition is known
/// before the host's handlers run; the video side-effect pipeline proceeds
/// as an independent cooperative task.
#[derive(Clone)]
pub struct UploadInterceptor {
    inner: Rc<InterceptorInner>,
}

struct InterceptorInner {
    tree: SharedTree,
    registry: Rc<RefCell<CapabilityRegistry>>,
    state: SharedUploadState,
    sink: Rc<dyn CompanionSink>,
    verbose: bool,
}

impl UploadInterceptor {
    pub fn new(
        tree: SharedTree,
        registry: Rc<RefCell<CapabilityRegistry>>,
        state: SharedUploadState,
        sink: Rc<dyn CompanionSink>,
        verbose: bool,
    ) -> Self {
        Self {
            inner: Rc::new(InterceptorInner {
                tree,
                registry,
                state,
                sink,
                verbose,
            }),
        }
    }

    pub fn state(&self) -> SharedUploadState {
        self.inner.state.clone()
    }

    /// Entry point for both `change` and `input` events on an upload
    /// control. Non-video selections pass through untouched.
    pub fn intercept_file_event(&self, input: NodeId) -> EventDisposition {
        let role = {
            let tree = self.inner.tree.borrow();
            if tree.attribute(input, "type") != Some("file") {
                return EventDisposition::PassThrough;
            }
            let Some(role) = control_role(&tree, input) else {
                return EventDisposition::PassThrough;
            };
            role
        };

        let Some(file) = self.inner.tree.borrow().file_payload(input).cloned() else {
            return EventDisposition::PassThrough;
        };
        if !is_video_file(&file.name, &file.media_type) {
            return EventDisposition::PassThrough;
        }

        // A sequence already running for this input (the change/input double
        // fire, or our own synthetic re-dispatch) is dropped, not queued.
        if self.inner.state.borrow().conversion_in_flight(input) {
            if self.inner.verbose {
                eprintln!("[DEBUG] conversion in flight; dropping duplicate trigger");
            }
            return EventDisposition::Suppressed;
        }

        self.inner.state.borrow_mut().record_selection(&file);
        if self.inner.verbose {
            eprintln!(
                "[DEBUG] intercepted video selection '{}' on {role:?}",
                file.name
            );
        }

        let interceptor = self.clone();
        tokio::task::spawn_local(async move {
            interceptor.run_video_pipeline(input, role, file).await;
        });
        EventDisposition::Suppressed
    }

    /// Drive one video selection to settlement. The in-progress flag is
    /// claimed before the first suspension point and released on every exit.
    async fn run_video_pipeline(&self, input: NodeId, role: UploadControl, file: FileSelection) {
        if !self.inner.state.borrow_mut().begin_conversion(input) {
            if self.inner.verbose {
                eprintln!("[DEBUG] conversion already in flight; dropping duplicate trigger");
            }
            return;
        }

        let result = self.video_pipeline(input, role, &file).await;
        self.inner.state.borrow_mut().finish_conversion(input);

        if let Err(error) = result {
            eprintln!("[WARN] avatar video handling failed: {error:#}");
            if let Some(toasts) = self.inner.registry.borrow().toasts() {
                toasts.error(
                    "Error converting video to animated webp",
                    None,
                    ToastOptions::default(),
                );
            }
        }
    }

    async fn video_pipeline(
        &self,
        input: NodeId,
        role: UploadControl,
        file: &FileSelection,
    ) -> Result<()> {
        // Preview first so the user sees feedback immediately; a failed
        // extraction falls back to the host's default avatar.
        let still_png = self.generate_preview(file).await;
        let preview_src = match &still_png {
            Some(png) => png_data_url(png),
            None => self.inner.registry.borrow().default_avatar(),
        };
        self.set_preview_src(&preview_src);

        // Whatever happens next, the host must only ever see a still image
        // in the control.
        let base_name = self
            .character_base_name()
            .or_else(|| Some(strip_extension(&file.name)).filter(|stem| !stem.is_empty()))
            .unwrap_or_else(|| "avatar".to_owned());
        if let Some(png) = &still_png {
            self.inner.tree.borrow_mut().set_file_payload(
                input,
                FileSelection::new(format!("{base_name}.png"), "image/png", png.clone()),
            );
        }

        let converter = self.inner.registry.borrow().converter();
        let Some(converter) = converter else {
            self.advise_converter_missing();
            return Ok(());
        };

        let progress = self.inner.registry.borrow().toasts().map(|toasts| {
            toasts.info(
                "Preparing video for upload. This may take several minutes.",
                Some("Please wait"),
                ToastOptions::sticky(),
            )
        });

        let converted = converter.convert(file).await;
        if let Some(progress) = progress {
            progress.dismiss();
        }
        let webp = converted.context("video conversion failed")?;
        if self.inner.verbose {
            eprintln!("[DEBUG] conversion produced {} bytes", webp.len());
        }

        match role {
            // Group and persona flows have no cropper; hand the (now still)
            // payload back to the host's native handlers.
            UploadControl::GroupAvatar | UploadControl::PersonaAvatar => {
                self.redispatch_change(input);
            }
            // The character still rides the host's normal save path; the
            // animated companion goes up separately under the base name.
            UploadControl::CharacterAvatar => match self.character_base_name() {
                Some(name) => {
                    if let Err(error) = self.inner.sink.upload(&name, &webp).await {
                        eprintln!("[WARN] failed to upload webp companion: {error:#}");
                    }
                }
                None => {
                    if self.inner.verbose {
                        eprintln!(
                            "[DEBUG] no character base name; skipping companion upload"
                        );
                    }
                }
            },
        }
        Ok(())
    }

    async fn generate_preview(&self, file: &FileSelection) -> Option<Vec<u8>> {
        let extractor = self.inner.registry.borrow().frame_extractor();
        let Some(extractor) = extractor else {
            eprintln!("[WARN] no frame extractor registered; using default avatar preview");
            return None;
        };
        match extractor.extract_still(file).await {
            Ok(frame) => match frame.encode_png() {
                Ok(png) => Some(png),
                Err(error) => {
                    eprintln!("[WARN] still frame encoding failed: {error:#}");
                    None
                }
            },
            Err(error) => {
                eprintln!("[WARN] thumbnail generation failed: {error:#}");
                None
            }
        }
    }

    fn set_preview_src(&self, src: &str) {
        let mut tree = self.inner.tree.borrow_mut();
        if let Some(preview) = tree.element_by_id(PREVIEW_ELEMENT_ID) {
            tree.set_attribute(preview, "src", src);
        }
    }

    fn character_base_name(&self) -> Option<String> {
        character_base_name(&self.inner.tree.borrow())
    }

    fn advise_converter_missing(&self) {
        if self.inner.state.borrow_mut().advisory_already_shown() {
            return;
        }
        let registry = self.inner.registry.borrow();
        let Some(toasts) = registry.toasts() else {
            return;
        };
        let menu = registry.extension_menu();
        let options = match menu {
            Some(menu) => ToastOptions::sticky_with_click(Rc::new(move || {
                menu.open(CONVERTER_ADDON_URL);
            })),
            None => ToastOptions::sticky(),
        };
        toasts.warning(
            "Click here to install the Video Background Loader extension",
            Some("Video avatar uploads require a downloadable add-on"),
            options,
        );
    }

    fn redispatch_change(&self, input: NodeId) {
        self.inner
            .tree
            .borrow_mut()
            .set_attribute(input, CONVERTED_ATTR, "1");
        if let Some(dispatcher) = self.inner.registry.borrow().change_dispatcher() {
            dispatcher.dispatch_change(input);
        }
        self.inner.tree.borrow_mut().remove_attribute(input, CONVERTED_ATTR);
    }
}
