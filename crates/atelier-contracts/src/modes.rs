use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{ModelCatalog, Provider};

/// High-level editing workflow category. Exactly one mode is active at a
/// time; switching modes swaps the active settings record but never touches
/// the image lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    Portrait,
    Restore,
    Creative,
    Composite,
}

impl WorkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkMode::Portrait => "portrait",
            WorkMode::Restore => "restore",
            WorkMode::Creative => "creative",
            WorkMode::Composite => "composite",
        }
    }

    pub fn all() -> [WorkMode; 4] {
        [
            WorkMode::Portrait,
            WorkMode::Restore,
            WorkMode::Creative,
            WorkMode::Composite,
        ]
    }
}

impl fmt::Display for WorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "portrait" => Ok(WorkMode::Portrait),
            "restore" => Ok(WorkMode::Restore),
            "creative" => Ok(WorkMode::Creative),
            "composite" => Ok(WorkMode::Composite),
            other => Err(format!("unknown work mode '{other}'")),
        }
    }
}

/// Session-level engine choice shared by every mode. The model must belong
/// to the provider's catalog; changing the provider resets the model to that
/// provider's default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSelection {
    pub provider: Provider,
    pub model: String,
}

impl Default for EngineSelection {
    fn default() -> Self {
        Self {
            provider: Provider::Gemini,
            model: "gemini-2.5-flash-image".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortraitSettings {
    #[serde(flatten)]
    pub engine: EngineSelection,
    pub target_resolution: String,
    pub auto_skin_texture: bool,
    pub auto_hair_detail: bool,
    pub auto_balance_lighting: bool,
    pub light_style: String,
    pub light_intensity: u8,
    pub auto_bokeh: bool,
    pub lens_profile: String,
    pub background_blur: u8,
    pub chromatic_aberration: bool,
    pub skin_smoothing: u8,
    pub remove_blemishes: bool,
    pub remove_wrinkles: bool,
    pub remove_dark_circles: bool,
    pub makeup: String,
    pub hair: String,
}

impl Default for PortraitSettings {
    fn default() -> Self {
        Self {
            engine: EngineSelection::default(),
            target_resolution: "8K".to_string(),
            auto_skin_texture: true,
            auto_hair_detail: true,
            auto_balance_lighting: true,
            light_style: "3-point".to_string(),
            light_intensity: 70,
            auto_bokeh: true,
            lens_profile: "85mm f/1.4".to_string(),
            background_blur: 80,
            chromatic_aberration: false,
            skin_smoothing: 40,
            remove_blemishes: true,
            remove_wrinkles: false,
            remove_dark_circles: true,
            makeup: String::new(),
            hair: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundProcessing {
    Remaster,
    NewStudio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreSettings {
    #[serde(flatten)]
    pub engine: EngineSelection,
    pub auto_clean: bool,
    pub hyper_real_skin: bool,
    pub hair_and_fabric_details: bool,
    pub resolution: String,
    pub auto_studio_light: bool,
    pub light_style: String,
    pub modern_auto_color: bool,
    pub auto_white_balance: bool,
    pub background_processing: BackgroundProcessing,
    pub studio_backdrop: String,
    pub context: String,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            engine: EngineSelection::default(),
            auto_clean: true,
            hyper_real_skin: true,
            hair_and_fabric_details: true,
            resolution: "4K".to_string(),
            auto_studio_light: true,
            light_style: "3-point".to_string(),
            modern_auto_color: true,
            auto_white_balance: true,
            background_processing: BackgroundProcessing::Remaster,
            studio_backdrop: "grey".to_string(),
            context: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreativeSettings {
    #[serde(flatten)]
    pub engine: EngineSelection,
    pub background_prompt: String,
    pub full_body_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSettings {
    #[serde(flatten)]
    pub engine: EngineSelection,
    pub light_match: u8,
    pub color_temp_match: u8,
    pub smart_shadows: bool,
    pub grain_match: bool,
    pub focus_match: bool,
    pub perspective_match: bool,
}

impl Default for CompositeSettings {
    fn default() -> Self {
        Self {
            engine: EngineSelection::default(),
            light_match: 85,
            color_temp_match: 90,
            smart_shadows: true,
            grain_match: true,
            focus_match: true,
            perspective_match: true,
        }
    }
}

/// Typed per-mode configuration. The prompt compiler and merge logic
/// pattern-match on the tag instead of probing fields at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModeSettings {
    Portrait(PortraitSettings),
    Restore(RestoreSettings),
    Creative(CreativeSettings),
    Composite(CompositeSettings),
}

impl ModeSettings {
    pub fn defaults(mode: WorkMode) -> Self {
        match mode {
            WorkMode::Portrait => ModeSettings::Portrait(PortraitSettings::default()),
            WorkMode::Restore => ModeSettings::Restore(RestoreSettings::default()),
            WorkMode::Creative => ModeSettings::Creative(CreativeSettings::default()),
            WorkMode::Composite => ModeSettings::Composite(CompositeSettings::default()),
        }
    }

    pub fn mode(&self) -> WorkMode {
        match self {
            ModeSettings::Portrait(_) => WorkMode::Portrait,
            ModeSettings::Restore(_) => WorkMode::Restore,
            ModeSettings::Creative(_) => WorkMode::Creative,
            ModeSettings::Composite(_) => WorkMode::Composite,
        }
    }

    pub fn engine(&self) -> &EngineSelection {
        match self {
            ModeSettings::Portrait(settings) => &settings.engine,
            ModeSettings::Restore(settings) => &settings.engine,
            ModeSettings::Creative(settings) => &settings.engine,
            ModeSettings::Composite(settings) => &settings.engine,
        }
    }

    pub fn engine_mut(&mut self) -> &mut EngineSelection {
        match self {
            ModeSettings::Portrait(settings) => &mut settings.engine,
            ModeSettings::Restore(settings) => &mut settings.engine,
            ModeSettings::Creative(settings) => &mut settings.engine,
            ModeSettings::Composite(settings) => &mut settings.engine,
        }
    }

    /// Shallow field overwrite. Unknown patch keys are ignored by the serde
    /// re-parse; known fields with ill-typed values fail validation.
    /// `provider` and `model` are cross-validated against the catalog, and a
    /// provider change without an explicit model resets the model to the new
    /// provider's default.
    pub fn merged(&self, patch: &Map<String, Value>, catalog: &ModelCatalog) -> Result<Self> {
        let mut raw = serde_json::to_value(self).context("settings serialization failed")?;
        let fields = raw
            .as_object_mut()
            .context("settings did not serialize to an object")?;
        for (key, value) in patch {
            if key == "mode" {
                continue;
            }
            fields.insert(key.clone(), value.clone());
        }
        let mut merged: ModeSettings =
            serde_json::from_value(raw).context("merged settings failed validation")?;

        let provider_changed = patch.contains_key("provider");
        let model_given = patch.contains_key("model");
        let engine = merged.engine_mut();
        let needs_default = (provider_changed && !model_given)
            || !catalog.contains(engine.provider, &engine.model);
        if needs_default {
            engine.model = catalog
                .default_for(engine.provider)
                .map(|model| model.name)
                .with_context(|| format!("no models cataloged for {}", engine.provider))?;
        }
        Ok(merged)
    }
}

/// One settings record per mode. Mode switches swap the active record
/// without mutating the others.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AllSettings {
    pub portrait: PortraitSettings,
    pub restore: RestoreSettings,
    pub creative: CreativeSettings,
    pub composite: CompositeSettings,
}

impl AllSettings {
    pub fn active(&self, mode: WorkMode) -> ModeSettings {
        match mode {
            WorkMode::Portrait => ModeSettings::Portrait(self.portrait.clone()),
            WorkMode::Restore => ModeSettings::Restore(self.restore.clone()),
            WorkMode::Creative => ModeSettings::Creative(self.creative.clone()),
            WorkMode::Composite => ModeSettings::Composite(self.composite.clone()),
        }
    }

    pub fn replace(&mut self, settings: ModeSettings) {
        match settings {
            ModeSettings::Portrait(value) => self.portrait = value,
            ModeSettings::Restore(value) => self.restore = value,
            ModeSettings::Creative(value) => self.creative = value,
            ModeSettings::Composite(value) => self.composite = value,
        }
    }

    /// Switching into Creative resets its workflow fields to defaults while
    /// keeping the previously chosen provider/model, which are session-level
    /// choices rather than per-workflow state.
    pub fn switch_mode(&mut self, new_mode: WorkMode) -> ModeSettings {
        if new_mode == WorkMode::Creative {
            self.creative = CreativeSettings {
                engine: self.creative.engine.clone(),
                ..CreativeSettings::default()
            };
        }
        self.active(new_mode)
    }
}
