//! Clip effects.
//!
//! Effects carry named scalar parameters and optional keyframe tracks.
//! Parameters live in a `BTreeMap` so iteration order is stable, which the
//! conform cache relies on when hashing an effect stack.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Effect type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum EffectKind {
    Opacity,
    Transform,
    Crop,
    ColorCorrection,
    Blur,
    Sharpen,
    Volume,
    Pan,
    AudioEq,
    /// Plugin effect identified by name. Assumed to alter the picture.
    Custom(String),
}

impl EffectKind {
    /// Effects that only touch the audio signal.
    pub fn is_audio_only(&self) -> bool {
        matches!(
            self,
            EffectKind::Volume | EffectKind::Pan | EffectKind::AudioEq
        )
    }

    /// Parameter defaults at which the effect leaves the picture untouched.
    ///
    /// `None` means the effect has no neutral setting.
    fn neutral_defaults(&self) -> Option<&'static [(&'static str, f64)]> {
        match self {
            EffectKind::Opacity => Some(&[("opacity", 1.0)]),
            EffectKind::Transform => Some(&[
                ("x", 0.0),
                ("y", 0.0),
                ("scale", 1.0),
                ("scale_x", 1.0),
                ("scale_y", 1.0),
                ("rotation", 0.0),
            ]),
            EffectKind::Crop => Some(&[
                ("left", 0.0),
                ("right", 0.0),
                ("top", 0.0),
                ("bottom", 0.0),
            ]),
            _ => None,
        }
    }
}

/// A keyframe on one parameter of an effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectKeyframe {
    /// Frame relative to the clip start.
    pub frame: u64,
    /// Parameter animated by this keyframe.
    pub param: String,
    /// Parameter value at `frame`.
    pub value: f64,
}

/// One effect instance on a clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    /// Stable identifier within the clip.
    pub id: String,

    #[serde(flatten)]
    pub kind: EffectKind,

    /// Disabled effects are ignored everywhere.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub params: BTreeMap<String, f64>,

    #[serde(default)]
    pub keyframes: Vec<EffectKeyframe>,
}

fn default_enabled() -> bool {
    true
}

impl Effect {
    /// Create an enabled effect without parameters.
    pub fn new(id: impl Into<String>, kind: EffectKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
            params: BTreeMap::new(),
            keyframes: Vec::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_param(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Whether the effect can change rendered pixels.
    pub fn is_visual(&self) -> bool {
        self.enabled && !self.kind.is_audio_only()
    }

    /// Whether the effect is at its neutral default: a known neutral
    /// setting, every parameter at that setting, and no keyframes.
    pub fn is_neutral(&self) -> bool {
        if !self.keyframes.is_empty() {
            return false;
        }
        let Some(defaults) = self.kind.neutral_defaults() else {
            return false;
        };
        self.params.iter().all(|(name, value)| {
            defaults
                .iter()
                .find(|(param, _)| param == name)
                .is_some_and(|(_, neutral)| value == neutral)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_opacity_is_neutral() {
        let effect = Effect::new("fx1", EffectKind::Opacity).with_param("opacity", 1.0);
        assert!(effect.is_neutral());
        let faded = Effect::new("fx1", EffectKind::Opacity).with_param("opacity", 0.5);
        assert!(!faded.is_neutral());
    }

    #[test]
    fn test_identity_transform_is_neutral() {
        let effect = Effect::new("xf", EffectKind::Transform)
            .with_param("x", 0.0)
            .with_param("scale", 1.0);
        assert!(effect.is_neutral());
    }

    #[test]
    fn test_keyframes_break_neutrality() {
        let mut effect = Effect::new("fx1", EffectKind::Opacity).with_param("opacity", 1.0);
        effect.keyframes.push(EffectKeyframe {
            frame: 10,
            param: "opacity".to_string(),
            value: 1.0,
        });
        assert!(!effect.is_neutral());
    }

    #[test]
    fn test_unknown_param_breaks_neutrality() {
        let effect = Effect::new("xf", EffectKind::Transform).with_param("skew", 0.0);
        assert!(!effect.is_neutral());
    }

    #[test]
    fn test_color_effects_are_never_neutral() {
        assert!(!Effect::new("cc", EffectKind::ColorCorrection).is_neutral());
        assert!(!Effect::new("p", EffectKind::Custom("glow".into())).is_neutral());
    }

    #[test]
    fn test_audio_effects_are_not_visual() {
        let effect = Effect::new("vol", EffectKind::Volume).with_param("gain_db", -6.0);
        assert!(!effect.is_visual());
    }

    #[test]
    fn test_effect_json_shape() {
        let json = r#"{"id":"fx","type":"custom","name":"glow","params":{"radius":2.0}}"#;
        let effect: Effect = serde_json::from_str(json).unwrap();
        assert_eq!(effect.kind, EffectKind::Custom("glow".into()));
        assert!(effect.enabled);
        assert_eq!(effect.params["radius"], 2.0);
    }
}
