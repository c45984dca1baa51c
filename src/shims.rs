//! Wrappers around host-owned capabilities.
//!
//! `VideoSafeNormalizer` sits in front of the host's image-format
//! normalization function so a video never reaches logic that assumes a
//! static image. `GuardedModalFactory`/`ModalGuard` compose with the host's
//! modal construct to bypass the crop UI for video selections and to keep
//! the crop confirmation path from dereferencing a missing cropper.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, Result};

use crate::capabilities::{
    CropperState, FrameExtractor, ImageNormalizer, ModalDelegate, ModalFactory, ModalPurpose,
    RESULT_AFFIRMATIVE,
};
use crate::frame::{decode_image_bytes, parse_data_url, png_data_url, StillFrame};
use crate::page::{FileSelection, NodeId, SharedTree};
use crate::upload::{character_base_name, is_video_file, SharedUploadState, PREVIEW_ELEMENT_ID};
use crate::LocalBoxFuture;

/// Normalization wrapper: videos become PNG stills before the host's own
/// normalization ever sees them; everything else delegates to whatever
/// implementation the host currently has registered.
pub struct VideoSafeNormalizer {
    tree: SharedTree,
    extractor: RefCell<Option<Rc<dyn FrameExtractor>>>,
    inner: RefCell<Option<Rc<dyn ImageNormalizer>>>,
}

impl VideoSafeNormalizer {
    pub fn new(tree: SharedTree) -> Self {
        Self {
            tree,
            extractor: RefCell::new(None),
            inner: RefCell::new(None),
        }
    }

    pub fn set_extractor(&self, extractor: Option<Rc<dyn FrameExtractor>>) {
        *self.extractor.borrow_mut() = extractor;
    }

    async fn still_from_video(&self, file: &FileSelection) -> Result<FileSelection> {
        let extractor = self
            .extractor
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("no frame extractor registered"))?;
        let frame = extractor.extract_still(file).await?;
        let png = frame.encode_png()?;

        let base_name = {
            let tree = self.tree.borrow();
            character_base_name(&tree)
                .or_else(|| {
                    let stem = crate::avatar_ref::strip_extension(&file.name);
                    (!stem.is_empty()).then_some(stem)
                })
                .unwrap_or_else(|| "avatar".to_owned())
        };

        // Keep the visible preview in step with what will be submitted.
        {
            let data_url = png_data_url(&png);
            let mut tree = self.tree.borrow_mut();
            if let Some(preview) = tree.element_by_id(PREVIEW_ELEMENT_ID) {
                tree.set_attribute(preview, "src", &data_url);
            }
        }

        Ok(FileSelection::new(
            format!("{base_name}.png"),
            "image/png",
            png,
        ))
    }
}

impl ImageNormalizer for VideoSafeNormalizer {
    fn normalize<'a>(
        &'a self,
        file: &'a FileSelection,
    ) -> LocalBoxFuture<'a, Result<FileSelection>> {
        Box::pin(async move {
            if is_video_file(&file.name, &file.media_type) {
                match self.still_from_video(file).await {
                    Ok(still) => return Ok(still),
                    Err(error) => {
                        eprintln!("[WARN] video normalization failed, delegating: {error:#}");
                    }
                }
            }
            let inner = self.inner.borrow().clone();
            match inner {
                Some(delegate) => delegate.normalize(file).await,
                None => Ok(file.clone()),
            }
        })
    }

    fn is_shim(&self) -> bool {
        true
    }

    fn replace_delegate(&self, delegate: Rc<dyn ImageNormalizer>) {
        if !delegate.is_shim() {
            *self.inner.borrow_mut() = Some(delegate);
        }
    }
}

/// Factory wrapper: every modal the host produces comes back wrapped in a
/// [`ModalGuard`]. Registering the guard as a factory is a no-op, so the
/// wrapping never stacks.
pub struct GuardedModalFactory {
    inner: RefCell<Option<Rc<dyn ModalFactory>>>,
    tree: SharedTree,
    state: SharedUploadState,
}

impl GuardedModalFactory {
    pub fn new(tree: SharedTree, state: SharedUploadState) -> Self {
        Self {
            inner: RefCell::new(None),
            tree,
            state,
        }
    }
}

impl ModalFactory for GuardedModalFactory {
    fn create(&self, purpose: ModalPurpose, crop_target: Option<NodeId>) -> Rc<dyn ModalDelegate> {
        match self.inner.borrow().clone() {
            Some(factory) => Rc::new(ModalGuard {
                delegate: factory.create(purpose, crop_target),
                tree: self.tree.clone(),
                state: self.state.clone(),
            }),
            // The host factory has not arrived yet; produce an inert modal
            // rather than crash the caller.
            None => Rc::new(InertModal {
                purpose,
                crop_target,
            }),
        }
    }

    fn is_guard(&self) -> bool {
        true
    }

    fn replace_delegate(&self, delegate: Rc<dyn ModalFactory>) {
        if !delegate.is_guard() {
            *self.inner.borrow_mut() = Some(delegate);
        }
    }
}

/// Decorator over one host modal instance.
pub struct ModalGuard {
    delegate: Rc<dyn ModalDelegate>,
    tree: SharedTree,
    state: SharedUploadState,
}

impl ModalGuard {
    /// The source the crop UI would have produced: the live preview image,
    /// falling back to the crop target's own source.
    fn bypass_source(&self) -> Option<String> {
        let tree = self.tree.borrow();
        if let Some(preview) = tree.element_by_id(PREVIEW_ELEMENT_ID) {
            if let Some(src) = tree.attribute(preview, "src") {
                if !src.is_empty() {
                    return Some(src.to_owned());
                }
            }
        }
        self.delegate
            .crop_target()
            .and_then(|target| tree.attribute(target, "src").map(str::to_owned))
    }

    /// Render a fresh copy of the crop-target image for the substitute
    /// cropper. A target whose source cannot be decoded yields a blank
    /// frame of the declared (or default) size.
    fn render_crop_target(&self) -> StillFrame {
        let tree = self.tree.borrow();
        let Some(target) = self.delegate.crop_target() else {
            return StillFrame::solid(256, 256, [0, 0, 0, 0]);
        };
        if let Some(src) = tree.attribute(target, "src") {
            if let Some((_, bytes)) = parse_data_url(src) {
                if let Ok(frame) = decode_image_bytes(&bytes) {
                    return frame;
                }
            }
        }
        let width = tree
            .attribute(target, "width")
            .and_then(|value| value.parse().ok())
            .unwrap_or(256);
        let height = tree
            .attribute(target, "height")
            .and_then(|value| value.parse().ok())
            .unwrap_or(256);
        StillFrame::solid(width, height, [0, 0, 0, 0])
    }
}

impl ModalDelegate for ModalGuard {
    fn purpose(&self) -> ModalPurpose {
        self.delegate.purpose()
    }

    fn crop_target(&self) -> Option<NodeId> {
        self.delegate.crop_target()
    }

    fn cropper(&self) -> Option<Rc<dyn CropperState>> {
        self.delegate.cropper()
    }

    fn install_cropper(&self, state: Rc<dyn CropperState>) {
        self.delegate.install_cropper(state);
    }

    fn show<'a>(&'a self) -> LocalBoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            if self.delegate.purpose() == ModalPurpose::Crop
                && self.state.borrow().last_selected_is_video()
            {
                // Cropping a video placeholder makes no sense; resolve with
                // the preview source the way a completed crop would.
                return Ok(self.bypass_source());
            }
            self.delegate.show().await
        })
    }

    fn complete<'a>(&'a self, result: i32) -> LocalBoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.delegate.purpose() == ModalPurpose::Crop && result >= RESULT_AFFIRMATIVE {
                let functional = self
                    .delegate
                    .cropper()
                    .map(|cropper| cropper.cropped_canvas().is_some())
                    .unwrap_or(false);
                if !functional {
                    self.delegate
                        .install_cropper(Rc::new(RenderedCropper {
                            frame: self.render_crop_target(),
                        }));
                }
            }
            self.delegate.complete(result).await
        })
    }
}

/// Substitute cropper state backed by a pre-rendered frame.
struct RenderedCropper {
    frame: StillFrame,
}

impl CropperState for RenderedCropper {
    fn cropped_canvas(&self) -> Option<StillFrame> {
        Some(self.frame.clone())
    }
}

/// Placeholder modal produced when the host factory is still absent.
struct InertModal {
    purpose: ModalPurpose,
    crop_target: Option<NodeId>,
}

impl ModalDelegate for InertModal {
    fn purpose(&self) -> ModalPurpose {
        self.purpose
    }

    fn crop_target(&self) -> Option<NodeId> {
        self.crop_target
    }

    fn cropper(&self) -> Option<Rc<dyn CropperState>> {
        None
    }

    fn install_cropper(&self, _state: Rc<dyn CropperState>) {}

    fn show<'a>(&'a self) -> LocalBoxFuture<'a, Result<Option<String>>> {
        Box::pin(async { Ok(None) })
    }

    fn complete<'a>(&'a self, _result: i32) -> LocalBoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
