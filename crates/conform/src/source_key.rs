//! Content identity of a timeline frame.
//!
//! A [`SourceKey`] names what a frame shows rather than where it sits on the
//! timeline: the clip, the source frame inside it, and the effect stack
//! applied to it. Moving a clip keeps its keys; trimming it keeps the keys
//! of the frames that remain.

use std::fmt::Write as _;

use splice_timeline::{Clip, ClipId, Effect, EffectKind};

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// 64-bit FNV-1a.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Content key of one encoded frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    pub clip_id: ClipId,
    pub source_frame: u64,
    pub effects_hash: u64,
}

impl SourceKey {
    pub fn new(clip_id: ClipId, source_frame: u64, effects_hash: u64) -> Self {
        Self {
            clip_id,
            source_frame,
            effects_hash,
        }
    }

    /// Key of the frame `clip` shows at timeline `frame`.
    pub fn at_timeline_frame(clip: &Clip, frame: u64, effects_hash: u64) -> Self {
        Self::new(clip.id.clone(), clip.source_frame_at(frame), effects_hash)
    }

    /// Filesystem-safe, collision-resistant name for the warm tier.
    pub fn storage_key(&self) -> String {
        let raw = self.clip_id.as_str();
        let mut safe: String = raw
            .chars()
            .take(48)
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if safe.is_empty() {
            safe.push('_');
        }
        format!(
            "{}-{:08x}_{}_{:016x}",
            safe,
            fnv1a_64(raw.as_bytes()) as u32,
            self.source_frame,
            self.effects_hash
        )
    }
}

/// Hash of a clip's enabled, picture-affecting effects.
///
/// Each effect is rendered to a canonical string covering its identity,
/// type, parameters and keyframes; the strings are sorted before hashing so
/// the result does not depend on stack order or map iteration order.
/// A clip without visual effects hashes to the FNV offset basis.
pub fn effects_hash(clip: &Clip) -> u64 {
    let mut parts: Vec<String> = clip.visual_effects().map(canonical_effect).collect();
    if parts.is_empty() {
        return FNV_OFFSET;
    }
    parts.sort_unstable();
    fnv1a_64(parts.join("\n").as_bytes())
}

fn canonical_effect(effect: &Effect) -> String {
    let mut out = String::new();
    let _ = write!(out, "id={};kind=", effect.id);
    match &effect.kind {
        EffectKind::Custom(name) => {
            let _ = write!(out, "custom:{name}");
        }
        other => {
            let _ = write!(out, "{other:?}");
        }
    }

    out.push_str(";params=");
    for (name, value) in &effect.params {
        let _ = write!(out, "{name}:{:016x},", float_bits(*value));
    }

    let mut keyframes: Vec<_> = effect
        .keyframes
        .iter()
        .map(|k| (k.param.as_str(), k.frame, float_bits(k.value)))
        .collect();
    keyframes.sort_unstable();
    out.push_str(";keyframes=");
    for (param, frame, bits) in keyframes {
        let _ = write!(out, "{param}@{frame}:{bits:016x},");
    }
    out
}

/// Bit pattern with `-0.0` folded onto `0.0`.
fn float_bits(value: f64) -> u64 {
    if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_timeline::{EffectKeyframe, FrameRate, MediaInfo, VideoCodec};

    fn clip() -> Clip {
        Clip::new(
            "clip/1",
            MediaInfo::video(VideoCodec::H264, 1920, 1080, FrameRate::integer(30)),
            0,
            100,
        )
    }

    #[test]
    fn test_fnv_reference_values() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_effect_order_does_not_matter() {
        let blur = Effect::new("b", EffectKind::Blur).with_param("radius", 2.0);
        let cc = Effect::new("c", EffectKind::ColorCorrection).with_param("gamma", 1.2);

        let mut one = clip();
        one.effects = vec![blur.clone(), cc.clone()];
        let mut two = clip();
        two.effects = vec![cc, blur];

        assert_eq!(effects_hash(&one), effects_hash(&two));
    }

    #[test]
    fn test_parameter_change_changes_hash() {
        let mut a = clip();
        a.effects = vec![Effect::new("b", EffectKind::Blur).with_param("radius", 2.0)];
        let mut b = clip();
        b.effects = vec![Effect::new("b", EffectKind::Blur).with_param("radius", 3.0)];
        assert_ne!(effects_hash(&a), effects_hash(&b));
    }

    #[test]
    fn test_keyframes_participate() {
        let mut a = clip();
        a.effects = vec![Effect::new("o", EffectKind::Opacity).with_param("opacity", 1.0)];
        let mut b = a.clone();
        b.effects[0].keyframes.push(EffectKeyframe {
            frame: 4,
            param: "opacity".into(),
            value: 0.0,
        });
        assert_ne!(effects_hash(&a), effects_hash(&b));
    }

    #[test]
    fn test_audio_and_disabled_effects_are_ignored() {
        let plain = clip();
        let mut with_audio = clip();
        with_audio.effects.push(Effect::new("v", EffectKind::Volume).with_param("gain_db", -3.0));
        let mut disabled = Effect::new("b", EffectKind::Blur).with_param("radius", 5.0);
        disabled.enabled = false;
        with_audio.effects.push(disabled);

        assert_eq!(effects_hash(&plain), effects_hash(&with_audio));
        assert_eq!(effects_hash(&plain), fnv1a_64(b""));
    }

    #[test]
    fn test_storage_key_is_path_safe() {
        let key = SourceKey::new(ClipId::new("../etc/passwd"), 12, 0xabc);
        let name = key.storage_key();
        assert!(!name.contains('/'));
        assert!(!name.contains('.'));
        assert!(name.ends_with("_12_0000000000000abc"));
    }

    #[test]
    fn test_storage_keys_differ_for_similar_ids() {
        let a = SourceKey::new(ClipId::new("a/b"), 0, 0).storage_key();
        let b = SourceKey::new(ClipId::new("a_b"), 0, 0).storage_key();
        assert_ne!(a, b);
    }
}
