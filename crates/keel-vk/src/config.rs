// SPDX-License-Identifier: CEPL-1.0
use crate::error::{VkError, VkResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const MAX_FRAMES_IN_FLIGHT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub app_name: String,
    /// Depth of the CPU-side frame ring (1..=3).
    pub frames_in_flight: u32,
    pub vsync: bool,
    /// Enables `VK_LAYER_KHRONOS_validation` and the debug-utils messenger.
    pub validation: bool,
    pub clear_color: [f32; 4],
    pub pipeline_cache_dir: PathBuf,
    pub descriptor_budget: DescriptorBudget,
    /// SPIR-V used by the built-in mesh pipeline. Without it `draw_mesh` is
    /// rejected.
    pub mesh_shader: Option<ShaderPaths>,
}

/// Per-frame descriptor pool capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DescriptorBudget {
    pub uniform_buffers: u32,
    pub combined_image_samplers: u32,
    pub storage_buffers: u32,
    pub max_sets: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShaderPaths {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "keel".to_owned(),
            frames_in_flight: 2,
            vsync: true,
            validation: cfg!(debug_assertions),
            clear_color: [0.02, 0.02, 0.04, 1.0],
            pipeline_cache_dir: PathBuf::from("PipelineCache"),
            descriptor_budget: DescriptorBudget::default(),
            mesh_shader: None,
        }
    }
}

impl Default for DescriptorBudget {
    fn default() -> Self {
        Self {
            uniform_buffers: 1000,
            combined_image_samplers: 1000,
            storage_buffers: 1000,
            max_sets: 1000,
        }
    }
}

impl RendererConfig {
    /// Reads `path`; a missing file yields defaults. Environment overrides are
    /// applied on top.
    pub fn load(path: impl AsRef<Path>) -> VkResult<Self> {
        let path = path.as_ref();
        let cfg = match std::fs::read_to_string(path) {
            Ok(s) => Self::from_toml_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("config {} not found, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(cfg.with_env_overrides())
    }

    pub fn from_toml_str(s: &str) -> VkResult<Self> {
        let cfg: Self = toml::from_str(s).map_err(|e| VkError::Config(e.to_string()))?;
        Ok(cfg.normalized())
    }

    /// `KEEL_VALIDATION`, `KEEL_VSYNC`, `KEEL_FRAMES_IN_FLIGHT`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn with_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |v: String| matches!(v.as_str(), "1" | "true" | "on");
        if let Some(v) = get("KEEL_VALIDATION") {
            self.validation = flag(v);
        }
        if let Some(v) = get("KEEL_VSYNC") {
            self.vsync = flag(v);
        }
        if let Some(v) = get("KEEL_FRAMES_IN_FLIGHT") {
            match v.parse::<u32>() {
                Ok(n) => self.frames_in_flight = n,
                Err(_) => tracing::warn!("ignoring KEEL_FRAMES_IN_FLIGHT={v:?}"),
            }
        }
        self.normalized()
    }

    pub fn normalized(mut self) -> Self {
        let clamped = self.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
        if clamped != self.frames_in_flight {
            tracing::warn!(
                "frames_in_flight {} out of range, using {}",
                self.frames_in_flight,
                clamped
            );
            self.frames_in_flight = clamped;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(RendererConfig::from_toml_str("").unwrap(), RendererConfig::default());
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let cfg = RendererConfig::from_toml_str(
            r#"
            frames_in_flight = 3
            vsync = false

            [descriptor_budget]
            storage_buffers = 16

            [mesh_shader]
            vertex = "shaders/mesh.vert.spv"
            fragment = "shaders/mesh.frag.spv"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.frames_in_flight, 3);
        assert!(!cfg.vsync);
        assert_eq!(cfg.descriptor_budget.storage_buffers, 16);
        assert_eq!(cfg.descriptor_budget.uniform_buffers, 1000);
        assert_eq!(
            cfg.mesh_shader.unwrap().vertex,
            PathBuf::from("shaders/mesh.vert.spv")
        );
        assert_eq!(cfg.pipeline_cache_dir, PathBuf::from("PipelineCache"));
    }

    #[test]
    fn frames_in_flight_is_clamped() {
        let cfg = RendererConfig::from_toml_str("frames_in_flight = 9").unwrap();
        assert_eq!(cfg.frames_in_flight, MAX_FRAMES_IN_FLIGHT);
        let cfg = RendererConfig::from_toml_str("frames_in_flight = 0").unwrap();
        assert_eq!(cfg.frames_in_flight, 1);
    }

    #[test]
    fn malformed_document_is_config_error() {
        let err = RendererConfig::from_toml_str("vsync = \"maybe\"").unwrap_err();
        assert!(matches!(err, VkError::Config(_)));
    }

    #[test]
    fn overrides_apply_after_parse() {
        let cfg = RendererConfig::default().with_overrides(|k| match k {
            "KEEL_VALIDATION" => Some("1".into()),
            "KEEL_VSYNC" => Some("0".into()),
            "KEEL_FRAMES_IN_FLIGHT" => Some("3".into()),
            _ => None,
        });
        assert!(cfg.validation);
        assert!(!cfg.vsync);
        assert_eq!(cfg.frames_in_flight, 3);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("keel-config-test-does-not-exist.toml");
        let cfg = RendererConfig::load(&path).unwrap();
        assert_eq!(cfg.app_name, "keel");
    }
}
