use std::rc::Rc;

use crate::avatar_ref::{is_upgrade_eligible_src, parse_avatar_src};
use crate::page::{NodeId, PageTree, SharedTree};
use crate::resolver::{CompanionCandidate, CompanionResolver};

/// Attribute marking an element as already upgraded. Marked elements are
/// never re-scanned; this is what keeps mutation-driven re-entry finite.
pub const UPGRADE_MARKER: &str = "data-animated-avatar";

/// Class applied to replacement video elements.
pub const VIDEO_AVATAR_CLASS: &str = "animated-avatar";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Disabled, already upgraded, unparsable, or no companion exists.
    Skipped,
    /// Animated image: the `src` attribute was swapped in place.
    SwappedImage { url: String },
    /// Video: the image was replaced by a new video element.
    ReplacedWithVideo { video: NodeId, url: String },
}

/// Scans the mirrored page for avatar images and swaps in their animated
/// companions. Cheap to clone; upgrades for separate elements run as
/// independent cooperative tasks.
#[derive(Clone)]
pub struct UpgradeEngine {
    inner: Rc<EngineInner>,
}

struct EngineInner {
    tree: SharedTree,
    resolver: Rc<CompanionResolver>,
    enabled: bool,
    verbose: bool,
}

impl UpgradeEngine {
    pub fn new(tree: SharedTree, resolver: Rc<CompanionResolver>, enabled: bool) -> Self {
        Self {
            inner: Rc::new(EngineInner {
                tree,
                resolver,
                enabled,
                verbose: false,
            }),
        }
    }

    pub fn with_verbose(tree: SharedTree, resolver: Rc<CompanionResolver>, enabled: bool) -> Self {
        Self {
            inner: Rc::new(EngineInner {
                tree,
                resolver,
                enabled,
                verbose: true,
            }),
        }
    }

    pub fn resolver(&self) -> &CompanionResolver {
        &self.inner.resolver
    }

    /// Avatar images under `root` that are eligible for an upgrade attempt:
    /// recognized source shape and no upgrade marker.
    pub fn scan(&self, root: NodeId) -> Vec<NodeId> {
        let tree = self.inner.tree.borrow();
        tree.subtree(root)
            .into_iter()
            .filter(|id| {
                tree.tag(*id) == Some("img")
                    && tree.attribute(*id, UPGRADE_MARKER).is_none()
                    && tree
                        .attribute(*id, "src")
                        .map(is_upgrade_eligible_src)
                        .unwrap_or(false)
            })
            .collect()
    }

    /// Attempt to upgrade a single image element. Leaves the element
    /// untouched (and unmarked, so later scans retry) when no companion
    /// resolves.
    pub async fn upgrade_one(&self, img: NodeId) -> UpgradeOutcome {
        if !self.inner.enabled {
            return UpgradeOutcome::Skipped;
        }

        let (src, base) = {
            let tree = self.inner.tree.borrow();
            if tree.tag(img) != Some("img") || tree.attribute(img, UPGRADE_MARKER).is_some() {
                return UpgradeOutcome::Skipped;
            }
            let Some(src) = tree.attribute(img, "src").map(str::to_owned) else {
                return UpgradeOutcome::Skipped;
            };
            (src, tree.base_url().clone())
        };

        let Some(avatar) = parse_avatar_src(&src, &base) else {
            return UpgradeOutcome::Skipped;
        };
        let Some(candidate) = self.inner.resolver.resolve(&avatar).await else {
            return UpgradeOutcome::Skipped;
        };

        let mut tree = self.inner.tree.borrow_mut();
        // Another task may have upgraded this element while we were probing.
        if tree.attribute(img, UPGRADE_MARKER).is_some() {
            return UpgradeOutcome::Skipped;
        }

        if !candidate.kind.is_video() {
            tree.set_attribute(img, "src", &candidate.url);
            tree.set_attribute(img, UPGRADE_MARKER, "1");
            if self.inner.verbose {
                eprintln!("[DEBUG] swapped avatar src to {}", candidate.url);
            }
            return UpgradeOutcome::SwappedImage { url: candidate.url };
        }

        let video = build_video_replacement(&mut tree, img, &candidate);
        if self.inner.verbose {
            eprintln!("[DEBUG] replaced avatar img with video {}", candidate.url);
        }
        UpgradeOutcome::ReplacedWithVideo {
            video,
            url: candidate.url,
        }
    }

    /// Fire-and-forget upgrade of every eligible element under `root`. Each
    /// element gets its own task; one slow or failed resolution never holds
    /// up the rest.
    pub fn upgrade_all(&self, root: NodeId) {
        for img in self.scan(root) {
            let engine = self.clone();
            tokio::task::spawn_local(async move {
                engine.upgrade_one(img).await;
            });
        }
    }
}

/// Build the silent inline looping video element, mirror the original's box
/// (sizing attributes, inline sizes, computed border radius, classes) and
/// accessibility text, then swap it into the original's slot in one step.
fn build_video_replacement(
    tree: &mut PageTree,
    img: NodeId,
    candidate: &CompanionCandidate,
) -> NodeId {
    let video = tree.create_element("video");
    for attr in ["autoplay", "loop", "muted", "playsinline"] {
        tree.set_attribute(video, attr, "");
    }
    tree.add_class(video, VIDEO_AVATAR_CLASS);
    for class in tree.class_list(img) {
        tree.add_class(video, &class);
    }

    for attr in ["width", "height"] {
        if let Some(value) = tree.attribute(img, attr).map(str::to_owned) {
            tree.set_attribute(video, attr, &value);
        }
    }
    for property in ["width", "height"] {
        if let Some(value) = tree.style(img, property).map(str::to_owned) {
            tree.set_style(video, property, &value);
        }
    }
    if let Some(radius) = tree.computed_style(img, "border-radius").map(str::to_owned) {
        tree.set_style(video, "border-radius", &radius);
    }
    tree.set_style(video, "object-fit", "cover");

    if let Some(alt) = tree.attribute(img, "alt").map(str::to_owned) {
        tree.set_attribute(video, "aria-label", &alt);
    }
    if let Some(title) = tree.attribute(img, "title").map(str::to_owned) {
        tree.set_attribute(video, "title", &title);
    }

    let source = tree.create_element("source");
    tree.set_attribute(source, "src", &candidate.url);
    tree.set_attribute(source, "type", candidate.kind.media_type());
    tree.append_child(video, source);

    tree.replace_node(img, video);
    tree.set_attribute(video, UPGRADE_MARKER, "1");
    video
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use tokio::task::LocalSet;
    use url::Url;

    use super::{UpgradeEngine, UpgradeOutcome, UPGRADE_MARKER};
    use crate::page::{NodeId, PageTree, SharedTree};
    use crate::resolver::test_support::FakeProbe;
    use crate::resolver::{AssetKind, CompanionResolver};

    fn tree() -> SharedTree {
        Rc::new(RefCell::new(PageTree::new(
            Url::parse("https://tavern.local/").expect("base url should parse"),
        )))
    }

    fn engine(tree: &SharedTree, probe: Rc<FakeProbe>) -> UpgradeEngine {
        let resolver = CompanionResolver::new(
            probe,
            vec![AssetKind::Webp, AssetKind::Webm, AssetKind::Mp4],
            true,
        );
        UpgradeEngine::new(tree.clone(), Rc::new(resolver), true)
    }

    fn insert_avatar_img(tree: &SharedTree, src: &str) -> NodeId {
        let mut tree = tree.borrow_mut();
        let img = tree.create_element("img");
        tree.set_attribute(img, "src", src);
        let body = tree.body();
        tree.append_child(body, img);
        img
    }

    #[tokio::test(flavor = "current_thread")]
    async fn webp_hit_swaps_src_in_place() {
        let tree = tree();
        let img = insert_avatar_img(&tree, "/thumbnail?type=avatar&file=Aria.png");
        let probe = Rc::new(FakeProbe::with_existing([
            "https://tavern.local/thumbnail?type=avatar&file=Aria.webp",
        ]));
        let engine = engine(&tree, probe);

        let outcome = engine.upgrade_one(img).await;
        assert_eq!(
            outcome,
            UpgradeOutcome::SwappedImage {
                url: "https://tavern.local/thumbnail?type=avatar&file=Aria.webp".to_owned()
            }
        );

        let tree = tree.borrow();
        assert_eq!(tree.tag(img), Some("img"));
        assert_eq!(
            tree.attribute(img, "src"),
            Some("https://tavern.local/thumbnail?type=avatar&file=Aria.webp")
        );
        assert_eq!(tree.attribute(img, UPGRADE_MARKER), Some("1"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn video_hit_replaces_element_preserving_box() {
        let tree = tree();
        let img = insert_avatar_img(&tree, "/thumbnail?type=avatar&file=Aria.png");
        {
            let mut tree = tree.borrow_mut();
            tree.set_attribute(img, "class", "avatar");
            tree.set_attribute(img, "width", "64");
            tree.set_attribute(img, "height", "64");
            tree.set_attribute(img, "alt", "Aria");
            tree.set_computed_style(img, "border-radius", "50%");
        }
        let probe = Rc::new(FakeProbe::with_existing([
            "https://tavern.local/user/images/Aria/Aria.webm",
        ]));
        let engine = engine(&tree, probe);

        let outcome = engine.upgrade_one(img).await;
        let UpgradeOutcome::ReplacedWithVideo { video, url } = outcome else {
            panic!("expected video replacement, got {outcome:?}");
        };
        assert_eq!(url, "https://tavern.local/user/images/Aria/Aria.webm");

        let tree = tree.borrow();
        assert_eq!(tree.tag(video), Some("video"));
        assert!(tree.is_attached(video));
        assert!(!tree.is_attached(img));
        for attr in ["autoplay", "loop", "muted", "playsinline"] {
            assert_eq!(tree.attribute(video, attr), Some(""), "{attr} missing");
        }
        assert_eq!(tree.attribute(video, "width"), Some("64"));
        assert_eq!(tree.attribute(video, "height"), Some("64"));
        assert_eq!(tree.style(video, "border-radius"), Some("50%"));
        assert_eq!(tree.style(video, "object-fit"), Some("cover"));
        assert_eq!(tree.attribute(video, "aria-label"), Some("Aria"));
        assert!(tree.class_list(video).contains(&"avatar".to_owned()));
        assert_eq!(tree.attribute(video, UPGRADE_MARKER), Some("1"));

        let children = tree.children(video);
        assert_eq!(children.len(), 1);
        let source = children[0];
        assert_eq!(tree.tag(source), Some("source"));
        assert_eq!(
            tree.attribute(source, "src"),
            Some("https://tavern.local/user/images/Aria/Aria.webm")
        );
        assert_eq!(tree.attribute(source, "type"), Some("video/webm"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn marked_elements_are_never_rescanned_or_reprobed() {
        let tree = tree();
        let img = insert_avatar_img(&tree, "/thumbnail?type=avatar&file=Aria.png");
        let probe = Rc::new(FakeProbe::with_existing([
            "https://tavern.local/thumbnail?type=avatar&file=Aria.webp",
        ]));
        let engine = engine(&tree, probe.clone());

        engine.upgrade_one(img).await;
        let probes_after_upgrade = probe.call_count();

        assert!(engine.scan(tree.borrow().body()).is_empty());
        assert_eq!(engine.upgrade_one(img).await, UpgradeOutcome::Skipped);
        assert_eq!(probe.call_count(), probes_after_upgrade);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn miss_leaves_element_unmarked_for_later_scans() {
        let tree = tree();
        let img = insert_avatar_img(&tree, "/thumbnail?type=avatar&file=Aria.png");
        let engine = engine(&tree, Rc::new(FakeProbe::default()));

        assert_eq!(engine.upgrade_one(img).await, UpgradeOutcome::Skipped);
        let body = tree.borrow().body();
        assert_eq!(engine.scan(body), vec![img]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unrecognized_sources_probe_nothing() {
        let tree = tree();
        insert_avatar_img(&tree, "/backgrounds/forest.png");
        let img = {
            let mut tree = tree.borrow_mut();
            let img = tree.create_element("img");
            tree.set_attribute(img, "src", "/img/logo.png");
            let body = tree.body();
            tree.append_child(body, img);
            img
        };
        let probe = Rc::new(FakeProbe::default());
        let engine = engine(&tree, probe.clone());

        let body = tree.borrow().body();
        assert!(engine.scan(body).is_empty());
        assert_eq!(engine.upgrade_one(img).await, UpgradeOutcome::Skipped);
        assert_eq!(probe.call_count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upgrade_all_covers_every_eligible_element() {
        let tree = tree();
        let first = insert_avatar_img(&tree, "/thumbnail?type=avatar&file=Aria.png");
        let second = insert_avatar_img(&tree, "/avatars/me.png");
        let probe = Rc::new(FakeProbe::with_existing([
            "https://tavern.local/thumbnail?type=avatar&file=Aria.webp",
            "https://tavern.local/thumbnail?type=persona&file=me.webp",
        ]));
        let engine = engine(&tree, probe);

        let local = LocalSet::new();
        local
            .run_until(async {
                let body = tree.borrow().body();
                engine.upgrade_all(body);
                tokio::task::yield_now().await;
            })
            .await;
        local.await;

        let tree = tree.borrow();
        assert_eq!(tree.attribute(first, UPGRADE_MARKER), Some("1"));
        assert_eq!(tree.attribute(second, UPGRADE_MARKER), Some("1"));
    }
}
