use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraEntry {
    pub file: String,
    #[serde(default = "default_lora_weight")]
    pub weight: f32,
}

/// Full generation settings carried through a run.
///
/// Every field is always defined. Partial updates arrive as
/// [`PartialGenerationConfig`] and are folded in with [`GenerationConfig::merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationConfig {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    /// Negative values ask the backend for a random seed.
    pub seed: i64,
    pub sampler: String,
    /// Empty means the backend's currently loaded model.
    pub model: String,
    pub strength: f32,
    pub shift: f32,
    pub stochastic_sampling_gamma: f32,
    pub loras: Vec<LoraEntry>,
    pub batch_count: u32,
    pub batch_size: u32,
    pub negative_prompt: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            steps: 20,
            guidance_scale: 7.0,
            seed: -1,
            sampler: "DPM++ 2M Karras".to_string(),
            model: String::new(),
            strength: 1.0,
            shift: 1.0,
            stochastic_sampling_gamma: 0.3,
            loras: Vec::new(),
            batch_count: 1,
            batch_size: 1,
            negative_prompt: String::new(),
        }
    }
}

impl GenerationConfig {
    /// Overwrites only the fields present in `partial`. A present LoRA list
    /// replaces the current one wholesale.
    pub fn merge(&mut self, partial: &PartialGenerationConfig) {
        if let Some(width) = partial.width {
            self.width = width;
        }
        if let Some(height) = partial.height {
            self.height = height;
        }
        if let Some(steps) = partial.steps {
            self.steps = steps;
        }
        if let Some(guidance_scale) = partial.guidance_scale {
            self.guidance_scale = guidance_scale;
        }
        if let Some(seed) = partial.seed {
            self.seed = seed;
        }
        if let Some(sampler) = &partial.sampler {
            self.sampler = sampler.clone();
        }
        if let Some(model) = &partial.model {
            self.model = model.clone();
        }
        if let Some(strength) = partial.strength {
            self.strength = strength;
        }
        if let Some(shift) = partial.shift {
            self.shift = shift;
        }
        if let Some(gamma) = partial.stochastic_sampling_gamma {
            self.stochastic_sampling_gamma = gamma;
        }
        if let Some(loras) = &partial.loras {
            self.loras = loras.clone();
        }
        if let Some(batch_count) = partial.batch_count {
            self.batch_count = batch_count;
        }
        if let Some(batch_size) = partial.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(negative_prompt) = &partial.negative_prompt {
            self.negative_prompt = negative_prompt.clone();
        }
    }

    /// Images one generation call is expected to return.
    pub fn images_per_call(&self) -> u32 {
        self.batch_count.max(1).saturating_mul(self.batch_size.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialGenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stochastic_sampling_gamma: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loras: Option<Vec<LoraEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
}

impl PartialGenerationConfig {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn default_lora_weight() -> f32 {
    1.0
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{GenerationConfig, LoraEntry, PartialGenerationConfig};

    #[test]
    fn merge_only_touches_present_fields() {
        let mut config = GenerationConfig {
            steps: 30,
            ..GenerationConfig::default()
        };
        config.merge(&PartialGenerationConfig {
            width: Some(512),
            ..PartialGenerationConfig::default()
        });
        assert_eq!(config.width, 512);
        assert_eq!(config.steps, 30);
        assert_eq!(config.height, GenerationConfig::default().height);
    }

    #[test]
    fn merge_replaces_lora_list_wholesale() {
        let mut config = GenerationConfig {
            loras: vec![
                LoraEntry {
                    file: "a.safetensors".to_string(),
                    weight: 0.5,
                },
                LoraEntry {
                    file: "b.safetensors".to_string(),
                    weight: 0.7,
                },
            ],
            ..GenerationConfig::default()
        };
        config.merge(&PartialGenerationConfig {
            loras: Some(vec![LoraEntry {
                file: "c.safetensors".to_string(),
                weight: 1.0,
            }]),
            ..PartialGenerationConfig::default()
        });
        assert_eq!(config.loras.len(), 1);
        assert_eq!(config.loras[0].file, "c.safetensors");
    }

    #[test]
    fn partial_config_omits_absent_fields_on_the_wire() -> anyhow::Result<()> {
        let partial: PartialGenerationConfig =
            serde_json::from_value(json!({"width": 768, "guidanceScale": 4.5}))?;
        assert_eq!(partial.width, Some(768));
        assert_eq!(partial.guidance_scale, Some(4.5));
        assert!(partial.steps.is_none());
        assert_eq!(
            serde_json::to_value(&partial)?,
            json!({"width": 768, "guidanceScale": 4.5})
        );
        assert!(!partial.is_empty());
        assert!(PartialGenerationConfig::default().is_empty());
        Ok(())
    }

    #[test]
    fn lora_weight_defaults_to_one() -> anyhow::Result<()> {
        let entry: LoraEntry = serde_json::from_value(json!({"file": "x.ckpt"}))?;
        assert_eq!(entry.weight, 1.0);
        Ok(())
    }

    #[test]
    fn images_per_call_never_drops_below_one() {
        let config = GenerationConfig {
            batch_count: 0,
            batch_size: 3,
            ..GenerationConfig::default()
        };
        assert_eq!(config.images_per_call(), 3);
    }
}
