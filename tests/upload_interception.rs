//! End-to-end upload interception: a video picked into the character avatar
//! control is suppressed, reduced to a PNG still for the host's save path,
//! and its converted companion is uploaded under the character's base name.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::task::LocalSet;
use url::Url;

use ava::capabilities::{
    CapabilityRegistry, FrameExtractor, ToastHandle, ToastLevel, ToastOptions, ToastSink,
    VideoConverter,
};
use ava::frame::{parse_data_url, StillFrame};
use ava::page::{FileSelection, NodeId, PageTree, SharedTree};
use ava::upload::{
    EventDisposition, UploadInterceptor, UploadState, CHARACTER_NAME_FIELD_ID,
    PREVIEW_ELEMENT_ID,
};
use ava::uploader::CompanionSink;
use ava::LocalBoxFuture;

struct SolidExtractor;

impl FrameExtractor for SolidExtractor {
    fn extract_still<'a>(
        &'a self,
        _file: &'a FileSelection,
    ) -> LocalBoxFuture<'a, Result<StillFrame>> {
        Box::pin(async { Ok(StillFrame::solid(4, 4, [64, 128, 192, 255])) })
    }
}

struct WebpConverter;

impl VideoConverter for WebpConverter {
    fn convert<'a>(&'a self, file: &'a FileSelection) -> LocalBoxFuture<'a, Result<Vec<u8>>> {
        let len = file.size();
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(vec![0x52; len])
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    uploads: RefCell<Vec<(String, Vec<u8>)>>,
}

impl CompanionSink for RecordingSink {
    fn upload<'a>(
        &'a self,
        base_name: &'a str,
        webp: &'a [u8],
    ) -> LocalBoxFuture<'a, Result<Value>> {
        self.uploads
            .borrow_mut()
            .push((base_name.to_owned(), webp.to_vec()));
        Box::pin(async { Ok(json!({})) })
    }
}

#[derive(Default)]
struct ToastLog {
    messages: RefCell<Vec<(ToastLevel, String)>>,
}

impl ToastSink for ToastLog {
    fn show(
        &self,
        level: ToastLevel,
        message: &str,
        _title: Option<&str>,
        _options: ToastOptions,
    ) -> ToastHandle {
        self.messages.borrow_mut().push((level, message.to_owned()));
        ToastHandle::detached()
    }
}

struct Host {
    tree: SharedTree,
    interceptor: UploadInterceptor,
    sink: Rc<RecordingSink>,
    toasts: Rc<ToastLog>,
    control: NodeId,
}

fn host(with_converter: bool) -> Host {
    let tree: SharedTree = Rc::new(RefCell::new(PageTree::new(
        Url::parse("https://tavern.local/").expect("base url should parse"),
    )));
    let control = {
        let mut tree = tree.borrow_mut();
        let preview = tree.create_element("img");
        tree.set_attribute(preview, "id", PREVIEW_ELEMENT_ID);
        let name_field = tree.create_element("input");
        tree.set_attribute(name_field, "id", CHARACTER_NAME_FIELD_ID);
        tree.set_attribute(name_field, "value", "Seraphina.png");
        let control = tree.create_element("input");
        tree.set_attribute(control, "type", "file");
        tree.set_attribute(control, "id", "add_avatar_button");
        let body = tree.body();
        tree.append_child(body, preview);
        tree.append_child(body, name_field);
        tree.append_child(body, control);
        control
    };

    let toasts = Rc::new(ToastLog::default());
    let sink = Rc::new(RecordingSink::default());
    let mut registry = CapabilityRegistry::new();
    registry.register_toasts(toasts.clone());
    registry.register_frame_extractor(Rc::new(SolidExtractor));
    if with_converter {
        registry.register_converter(Rc::new(WebpConverter));
    }

    let interceptor = UploadInterceptor::new(
        tree.clone(),
        Rc::new(RefCell::new(registry)),
        Rc::new(RefCell::new(UploadState::default())),
        sink.clone(),
        false,
    );
    Host {
        tree,
        interceptor,
        sink,
        toasts,
        control,
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(flavor = "current_thread")]
async fn quicktime_selection_yields_png_still_and_webp_companion() {
    let host = host(true);
    host.tree.borrow_mut().set_file_payload(
        host.control,
        FileSelection::new("clip.mov", "video/quicktime", vec![7; 32]),
    );

    let local = LocalSet::new();
    local
        .run_until(async {
            let disposition = host.interceptor.intercept_file_event(host.control);
            assert_eq!(disposition, EventDisposition::Suppressed);
            settle().await;
        })
        .await;

    let tree = host.tree.borrow();
    // The host's save path sees a PNG named after the character.
    let payload = tree
        .file_payload(host.control)
        .expect("control should hold a payload");
    assert_eq!(payload.name, "Seraphina.png");
    assert_eq!(payload.media_type, "image/png");
    ava::frame::decode_image_bytes(&payload.bytes).expect("payload should be a decodable PNG");

    // The preview shows the extracted frame as a data URL.
    let preview = tree
        .element_by_id(PREVIEW_ELEMENT_ID)
        .expect("preview element");
    let src = tree.attribute(preview, "src").expect("preview src");
    let (media_type, _) = parse_data_url(src).expect("preview should be a data URL");
    assert_eq!(media_type, "image/png");

    // The converted companion went up under the character base name.
    let uploads = host.sink.uploads.borrow();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "Seraphina");
    assert_eq!(uploads[0].1, vec![0x52; 32]);
}

#[tokio::test(flavor = "current_thread")]
async fn image_selection_never_engages_the_machine() {
    let host = host(true);
    host.tree.borrow_mut().set_file_payload(
        host.control,
        FileSelection::new("portrait.png", "image/png", vec![1; 16]),
    );

    let local = LocalSet::new();
    local
        .run_until(async {
            let disposition = host.interceptor.intercept_file_event(host.control);
            assert_eq!(disposition, EventDisposition::PassThrough);
            settle().await;
        })
        .await;

    let tree = host.tree.borrow();
    assert_eq!(
        tree.file_payload(host.control).map(|file| file.name.clone()),
        Some("portrait.png".to_owned())
    );
    let preview = tree
        .element_by_id(PREVIEW_ELEMENT_ID)
        .expect("preview element");
    assert_eq!(tree.attribute(preview, "src"), None);
    assert!(host.sink.uploads.borrow().is_empty());
    assert!(host.toasts.messages.borrow().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn absent_converter_still_substitutes_and_advises_once() {
    let host = host(false);
    host.tree.borrow_mut().set_file_payload(
        host.control,
        FileSelection::new("clip.webm", "video/webm", vec![9; 8]),
    );

    let local = LocalSet::new();
    local
        .run_until(async {
            host.interceptor.intercept_file_event(host.control);
            settle().await;

            // The user tries again with another clip.
            host.tree.borrow_mut().set_file_payload(
                host.control,
                FileSelection::new("other.mp4", "video/mp4", vec![3; 8]),
            );
            host.interceptor.intercept_file_event(host.control);
            settle().await;
        })
        .await;

    assert!(host.sink.uploads.borrow().is_empty());
    let warnings = host
        .toasts
        .messages
        .borrow()
        .iter()
        .filter(|(level, _)| *level == ToastLevel::Warning)
        .count();
    assert_eq!(warnings, 1);

    // Still substitution happened regardless.
    let tree = host.tree.borrow();
    assert_eq!(
        tree.file_payload(host.control)
            .map(|file| file.media_type.clone()),
        Some("image/png".to_owned())
    );
}
