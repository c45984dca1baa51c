use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::avatar_ref::AvatarRef;
use crate::LocalBoxFuture;

/// Companion asset flavors, in the shape the host serves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Webp,
    Webm,
    Mp4,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Webm => "webm",
            Self::Mp4 => "mp4",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Webp => ".webp",
            Self::Webm => ".webm",
            Self::Mp4 => ".mp4",
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            Self::Webp => "image/webp",
            Self::Webm => "video/webm",
            Self::Mp4 => "video/mp4",
        }
    }

    /// Animated images are swapped in place; videos require element
    /// replacement.
    pub fn is_video(self) -> bool {
        matches!(self, Self::Webm | Self::Mp4)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "webp" => Some(Self::Webp),
            "webm" => Some(Self::Webm),
            "mp4" => Some(Self::Mp4),
            _ => None,
        }
    }
}

/// One probe target: an absolute URL plus the asset flavor it would serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionCandidate {
    pub url: String,
    pub kind: AssetKind,
}

/// Derive the ordered companion candidates for an avatar reference.
///
/// For each preference key two URL forms are emitted, thumbnail service
/// first: `<origin>/thumbnail?type=<kind>&file=<base>.<ext>` and
/// `<origin>/user/images/<base>/<base>.<ext>` (the folder companion uploads
/// land in). Candidates are probed in exactly this order; first hit wins.
pub fn derive_candidates(avatar: &AvatarRef, order: &[AssetKind]) -> Vec<CompanionCandidate> {
    let Ok(origin) = Url::parse(&avatar.origin) else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(order.len() * 2);
    for kind in order {
        let file = format!("{}{}", avatar.base_name, kind.extension());

        let mut thumb = origin.clone();
        thumb.set_path("/thumbnail");
        thumb
            .query_pairs_mut()
            .append_pair("type", avatar.kind.as_str())
            .append_pair("file", &file);
        out.push(CompanionCandidate {
            url: thumb.to_string(),
            kind: *kind,
        });

        let mut direct = origin.clone();
        if let Ok(mut segments) = direct.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["user", "images", avatar.base_name.as_str(), file.as_str()]);
        }
        out.push(CompanionCandidate {
            url: direct.to_string(),
            kind: *kind,
        });
    }
    out
}

/// Session-lifetime memo of probe outcomes, positive and negative. Never
/// evicted, never persisted.
#[derive(Debug, Default)]
pub struct ProbeCache {
    entries: RefCell<HashMap<String, bool>>,
}

impl ProbeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<bool> {
        self.entries.borrow().get(url).copied()
    }

    pub fn insert(&self, url: &str, exists: bool) {
        self.entries.borrow_mut().insert(url.to_owned(), exists);
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

/// Transport seam for existence checks. Production probes over HTTP; tests
/// substitute an in-memory implementation.
pub trait Probe {
    /// Whether `url` exists. `use_head` selects a HEAD request over GET.
    /// Transport failures surface as `Err` and are treated as absence.
    fn exists<'a>(&'a self, url: &'a str, use_head: bool) -> LocalBoxFuture<'a, Result<bool>>;
}

/// HTTP existence probe. Any non-2xx status or transport error reads as
/// "does not exist".
#[derive(Debug, Clone)]
pub struct HttpProbe {
    http: Client,
}

impl HttpProbe {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

impl Probe for HttpProbe {
    fn exists<'a>(&'a self, url: &'a str, use_head: bool) -> LocalBoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let request = if use_head {
                self.http.head(url)
            } else {
                self.http.get(url)
            };
            let response = request
                .header("Cache-Control", "no-store")
                .send()
                .await
                .with_context(|| format!("probe request failed for {url}"))?;
            Ok(response.status().is_success())
        })
    }
}

/// Resolves an avatar reference to its first existing companion asset,
/// memoizing every probe outcome for the session.
pub struct CompanionResolver {
    probe: Rc<dyn Probe>,
    cache: ProbeCache,
    order: Vec<AssetKind>,
    use_head_probe: bool,
    verbose: bool,
}

impl CompanionResolver {
    pub fn new(probe: Rc<dyn Probe>, order: Vec<AssetKind>, use_head_probe: bool) -> Self {
        Self {
            probe,
            cache: ProbeCache::new(),
            order,
            use_head_probe,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn order(&self) -> &[AssetKind] {
        &self.order
    }

    pub fn cache(&self) -> &ProbeCache {
        &self.cache
    }

    /// Memoized existence check. A URL already in the cache never reaches
    /// the transport again, whichever way the earlier probe went.
    pub async fn url_exists(&self, url: &str) -> bool {
        if let Some(known) = self.cache.get(url) {
            return known;
        }
        let exists = match self.probe.exists(url, self.use_head_probe).await {
            Ok(exists) => exists,
            Err(error) => {
                if self.verbose {
                    eprintln!("[DEBUG] probe error for {url}: {error:#}");
                }
                false
            }
        };
        self.cache.insert(url, exists);
        exists
    }

    /// Walk the candidate list in preference order and return the first
    /// existing companion. Probing short-circuits on the first hit.
    pub async fn resolve(&self, avatar: &AvatarRef) -> Option<CompanionCandidate> {
        for candidate in derive_candidates(avatar, &self.order) {
            if self.url_exists(&candidate.url).await {
                if self.verbose {
                    eprintln!(
                        "[DEBUG] companion hit: {} ({})",
                        candidate.url,
                        candidate.kind.as_str()
                    );
                }
                return Some(candidate);
            }
        }
        None
    }
}


#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::test_support::FakeProbe;
    use super::{derive_candidates, AssetKind, CompanionResolver};
    use crate::avatar_ref::{parse_avatar_src, AvatarRef, AvatarKind};
    use url::Url;

    fn aria() -> AvatarRef {
        parse_avatar_src(
            "/thumbnail?type=avatar&file=Aria.png",
            &Url::parse("https://tavern.local/").expect("base url should parse"),
        )
        .expect("avatar ref should parse")
    }

    fn default_order() -> Vec<AssetKind> {
        vec![AssetKind::Webp, AssetKind::Webm, AssetKind::Mp4]
    }

    #[test]
    fn candidates_follow_preference_order_thumbnail_first() {
        let candidates = derive_candidates(&aria(), &default_order());
        assert_eq!(candidates.len(), 6);
        assert_eq!(
            candidates[0].url,
            "https://tavern.local/thumbnail?type=avatar&file=Aria.webp"
        );
        assert_eq!(
            candidates[1].url,
            "https://tavern.local/user/images/Aria/Aria.webp"
        );
        assert_eq!(candidates[2].kind, AssetKind::Webm);
        assert_eq!(
            candidates[5].url,
            "https://tavern.local/user/images/Aria/Aria.mp4"
        );
    }

    #[test]
    fn candidates_percent_encode_names() {
        let avatar = AvatarRef {
            kind: AvatarKind::Persona,
            base_name: "Old Man".to_owned(),
            origin: "https://tavern.local".to_owned(),
        };
        let candidates = derive_candidates(&avatar, &[AssetKind::Webm]);
        assert_eq!(
            candidates[0].url,
            "https://tavern.local/thumbnail?type=persona&file=Old+Man.webm"
        );
        assert_eq!(
            candidates[1].url,
            "https://tavern.local/user/images/Old%20Man/Old%20Man.webm"
        );
    }

    #[test]
    fn empty_order_yields_no_candidates() {
        assert!(derive_candidates(&aria(), &[]).is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn resolve_short_circuits_on_first_hit() {
        let probe = Rc::new(FakeProbe::with_existing([
            "https://tavern.local/user/images/Aria/Aria.webp",
        ]));
        let resolver = CompanionResolver::new(probe.clone(), default_order(), true);

        let hit = resolver.resolve(&aria()).await.expect("companion expected");
        assert_eq!(hit.kind, AssetKind::Webp);
        assert_eq!(hit.url, "https://tavern.local/user/images/Aria/Aria.webp");
        // Candidates after the hit are never probed.
        assert_eq!(probe.call_count(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn resolve_prefers_video_when_only_video_exists() {
        let probe = Rc::new(FakeProbe::with_existing([
            "https://tavern.local/user/images/Aria/Aria.webm",
        ]));
        let resolver = CompanionResolver::new(probe, default_order(), true);

        let hit = resolver.resolve(&aria()).await.expect("companion expected");
        assert_eq!(hit.kind, AssetKind::Webm);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn probe_outcomes_are_cached_both_ways() {
        let probe = Rc::new(FakeProbe::with_existing([
            "https://tavern.local/thumbnail?type=avatar&file=Aria.webp",
        ]));
        let resolver = CompanionResolver::new(probe.clone(), default_order(), true);

        assert!(resolver.url_exists("https://tavern.local/thumbnail?type=avatar&file=Aria.webp").await);
        assert!(!resolver.url_exists("https://tavern.local/user/images/Aria/Aria.mp4").await);
        let after_first_round = probe.call_count();

        assert!(resolver.url_exists("https://tavern.local/thumbnail?type=avatar&file=Aria.webp").await);
        assert!(!resolver.url_exists("https://tavern.local/user/images/Aria/Aria.mp4").await);
        assert_eq!(probe.call_count(), after_first_round);
        assert_eq!(resolver.cache().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn miss_probes_every_candidate_once() {
        let probe = Rc::new(FakeProbe::default());
        let resolver = CompanionResolver::new(probe.clone(), default_order(), true);

        assert!(resolver.resolve(&aria()).await.is_none());
        assert_eq!(probe.call_count(), 6);

        // A second resolution is served entirely from the cache.
        assert!(resolver.resolve(&aria()).await.is_none());
        assert_eq!(probe.call_count(), 6);
    }
}
