use std::sync::OnceLock;

use regex::Regex;
use url::Url;

/// Which avatar namespace a reference belongs to. The host serves character
/// avatars and user personas from different thumbnail types and folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarKind {
    Avatar,
    Persona,
}

impl AvatarKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avatar => "avatar",
            Self::Persona => "persona",
        }
    }

    pub fn from_thumbnail_type(raw: &str) -> Option<Self> {
        match raw {
            "avatar" => Some(Self::Avatar),
            "persona" => Some(Self::Persona),
            _ => None,
        }
    }
}

/// A parsed avatar image reference. `kind` and `base_name` are always both
/// present; unrecognized sources never produce a ref at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarRef {
    pub kind: AvatarKind,
    pub base_name: String,
    pub origin: String,
}

fn extension_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.[a-z0-9]+$").expect("extension regex is valid"))
}

fn video_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\.(webm|mp4|m4v|mov|ogg)$").expect("video name regex is valid")
    })
}

fn static_image_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\.(png|jpe?g|gif|webp)$").expect("static image regex is valid")
    })
}

/// Strip a trailing `.ext` (last dot only). Returns the input unchanged when
/// there is no recognizable extension.
pub fn strip_extension(name: &str) -> String {
    extension_re().replace(name, "").into_owned()
}

pub fn has_video_extension(name: &str) -> bool {
    video_name_re().is_match(name)
}

pub fn has_static_image_extension(name: &str) -> bool {
    static_image_name_re().is_match(name)
}

/// Parse an avatar `src` attribute into an [`AvatarRef`].
///
/// Recognized shapes, matching the host's serving conventions:
/// - `/thumbnail?type=<avatar|persona>&file=<name.ext>`
/// - `/characters/<name.ext>` (character avatar file)
/// - `/avatars/<name.ext>` (persona avatar file)
///
/// Relative sources are resolved against `base`. Anything else yields `None`.
pub fn parse_avatar_src(src: &str, base: &Url) -> Option<AvatarRef> {
    let url = base.join(src.trim()).ok()?;
    let origin = url.origin().ascii_serialization();
    let path_lower = url.path().to_ascii_lowercase();

    if path_lower.contains("/thumbnail") {
        let mut kind = None;
        let mut file = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "type" => kind = AvatarKind::from_thumbnail_type(value.as_ref()),
                "file" => {
                    if !value.is_empty() {
                        file = Some(value.into_owned());
                    }
                }
                _ => {}
            }
        }
        let (kind, file) = (kind?, file?);
        return Some(AvatarRef {
            kind,
            base_name: strip_extension(&file),
            origin,
        });
    }

    let direct_kind = if path_lower.contains("/characters/") {
        Some(AvatarKind::Avatar)
    } else if path_lower.contains("/avatars/") {
        Some(AvatarKind::Persona)
    } else {
        None
    };

    let kind = direct_kind?;
    let file_name = url.path_segments()?.last()?.to_owned();
    if file_name.is_empty() {
        return None;
    }
    let base_name = strip_extension(&file_name);
    if base_name.is_empty() {
        return None;
    }
    Some(AvatarRef {
        kind,
        base_name,
        origin,
    })
}

/// Whether a `src` attribute looks like an avatar the upgrade engine should
/// consider at all: a direct static-image file under a recognized folder, or
/// an avatar/persona thumbnail query.
pub fn is_upgrade_eligible_src(src: &str) -> bool {
    let is_direct_image = has_static_image_extension(src);
    let is_avatar_thumb = src.contains("/thumbnail")
        && (src.contains("type=avatar") || src.contains("type=persona"));
    let in_known_folder = src.contains("/avatars/")
        || src.contains("/characters/")
        || is_avatar_thumb;
    in_known_folder && (is_direct_image || is_avatar_thumb)
}
