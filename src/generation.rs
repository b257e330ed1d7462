use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::LedgerError;
use crate::store_types::Visibility;

macro_rules! closed_set {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw {
                    $($wire => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

closed_set!(AspectRatio {
    Aspect10x16 => "ASPECT_10_16",
    Aspect16x10 => "ASPECT_16_10",
    Aspect9x16 => "ASPECT_9_16",
    Aspect16x9 => "ASPECT_16_9",
    Aspect3x2 => "ASPECT_3_2",
    Aspect2x3 => "ASPECT_2_3",
    Aspect4x3 => "ASPECT_4_3",
    Aspect3x4 => "ASPECT_3_4",
    Aspect1x1 => "ASPECT_1_1",
    Aspect1x3 => "ASPECT_1_3",
    Aspect3x1 => "ASPECT_3_1",
});

closed_set!(
    /// Generation model version offered by the provider.
    ImageModel {
        V1 => "V_1",
        V1Turbo => "V_1_TURBO",
        V2 => "V_2",
        V2Turbo => "V_2_TURBO",
    }
);

closed_set!(MagicPrompt {
    Auto => "AUTO",
    On => "ON",
    Off => "OFF",
});

closed_set!(Style {
    General => "GENERAL",
    Realistic => "REALISTIC",
    Design => "DESIGN",
    Render3d => "RENDER_3D",
    Anime => "ANIME",
});

/// Untrusted request as decoded by the request-handling layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationInput {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub aspect_ratio: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub magic_prompt_option: String,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub is_public: bool,
}

impl GenerationInput {
    pub fn validate(&self) -> Result<GenerationRequest, LedgerError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty()
            || self.aspect_ratio.is_empty()
            || self.model.is_empty()
            || self.magic_prompt_option.is_empty()
            || self.style.is_empty()
        {
            return Err(invalid("missing required fields"));
        }

        let model = ImageModel::parse(&self.model)
            .ok_or_else(|| invalid(format!("invalid model selection: {}", self.model)))?;
        let aspect_ratio = AspectRatio::parse(&self.aspect_ratio).ok_or_else(|| {
            invalid(format!(
                "invalid aspect ratio selection: {}",
                self.aspect_ratio
            ))
        })?;
        let magic_prompt = MagicPrompt::parse(&self.magic_prompt_option).ok_or_else(|| {
            invalid(format!(
                "invalid magic prompt option: {}",
                self.magic_prompt_option
            ))
        })?;
        let style = Style::parse(&self.style)
            .ok_or_else(|| invalid(format!("invalid style selection: {}", self.style)))?;

        Ok(GenerationRequest {
            prompt: prompt.to_string(),
            aspect_ratio,
            model,
            magic_prompt,
            style,
            visibility: if self.is_public {
                Visibility::Public
            } else {
                Visibility::Private
            },
        })
    }
}

fn invalid(reason: impl Into<String>) -> LedgerError {
    LedgerError::InvalidRequest {
        reason: reason.into(),
    }
}

/// A request whose every field is drawn from its closed set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub model: ImageModel,
    pub magic_prompt: MagicPrompt,
    pub style: Style,
    pub visibility: Visibility,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedItem {
    pub uri: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("upstream error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<UpstreamError> for LedgerError {
    fn from(err: UpstreamError) -> Self {
        LedgerError::UpstreamFailure {
            status: err.status,
            message: err.message,
        }
    }
}

/// The external generation resource. Succeeds or fails synchronously.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<GeneratedItem>, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> GenerationInput {
        GenerationInput {
            prompt: "  a red fox in snow ".to_string(),
            aspect_ratio: "ASPECT_16_9".to_string(),
            model: "V_2_TURBO".to_string(),
            magic_prompt_option: "AUTO".to_string(),
            style: "RENDER_3D".to_string(),
            is_public: true,
        }
    }

    #[test]
    fn valid_input_maps_to_closed_sets() {
        let request = input().validate().expect("valid");
        assert_eq!(request.prompt, "a red fox in snow");
        assert_eq!(request.aspect_ratio, AspectRatio::Aspect16x9);
        assert_eq!(request.model, ImageModel::V2Turbo);
        assert_eq!(request.magic_prompt, MagicPrompt::Auto);
        assert_eq!(request.style, Style::Render3d);
        assert_eq!(request.visibility, Visibility::Public);
    }

    #[test]
    fn missing_fields_are_rejected() {
        let mut blank_prompt = input();
        blank_prompt.prompt = "   ".to_string();
        let err = blank_prompt.validate().expect_err("blank prompt");
        assert!(matches!(
            err,
            LedgerError::InvalidRequest { ref reason } if reason == "missing required fields"
        ));

        let mut no_style = input();
        no_style.style.clear();
        assert!(no_style.validate().is_err());
    }

    #[test]
    fn values_outside_each_set_are_rejected() {
        let mut bad_model = input();
        bad_model.model = "V_3".to_string();
        let err = bad_model.validate().expect_err("model");
        assert!(err.to_string().contains("invalid model selection"));

        let mut bad_ratio = input();
        bad_ratio.aspect_ratio = "ASPECT_5_4".to_string();
        assert!(bad_ratio.validate().is_err());

        let mut bad_magic = input();
        bad_magic.magic_prompt_option = "on".to_string();
        assert!(bad_magic.validate().is_err());

        let mut bad_style = input();
        bad_style.style = "PIXEL".to_string();
        assert!(bad_style.validate().is_err());
    }

    #[test]
    fn wire_names_round_trip_through_serde() {
        for ratio in AspectRatio::ALL {
            let json = serde_json::to_string(ratio).expect("serialize");
            assert_eq!(json, format!("\"{}\"", ratio.as_str()));
        }
        let style: Style = serde_json::from_str("\"RENDER_3D\"").expect("deserialize");
        assert_eq!(style, Style::Render3d);
    }

    #[test]
    fn input_decodes_camel_case_payloads() {
        let input: GenerationInput = serde_json::from_value(serde_json::json!({
            "prompt": "castle",
            "aspectRatio": "ASPECT_1_1",
            "model": "V_1",
            "magicPromptOption": "OFF",
            "style": "ANIME",
            "isPublic": false
        }))
        .expect("decode");
        let request = input.validate().expect("valid");
        assert_eq!(request.visibility, Visibility::Private);
        assert_eq!(request.magic_prompt, MagicPrompt::Off);
    }
}
