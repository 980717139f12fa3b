pub mod device;
pub mod pool;
pub mod tokenize;

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use candle_transformers::models::xlm_roberta::{Config as XLMRobertaConfig, XLMRobertaModel};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use semsearch_core::config::{expand_path, Architecture, EmbeddingSettings};
use semsearch_core::traits::Embedder;

pub use device::select_device;
pub use pool::masked_mean_l2;
pub use tokenize::{tokenize_on_device, HfTokenCodec};

enum Encoder {
    Bert(BertModel),
    XlmRoberta(XLMRobertaModel),
}

impl Encoder {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = match self {
            Self::Bert(m) => m.forward(input_ids, &token_type_ids, Some(attention_mask))?,
            Self::XlmRoberta(m) => m.forward(input_ids, attention_mask, &token_type_ids, None, None, None)?,
        };
        Ok(hidden)
    }
}

/// Local transformer encoder with masked mean pooling and L2 normalization.
///
/// The model directory must contain `tokenizer.json`, `config.json` and either
/// `model.safetensors` or `pytorch_model.bin`.
pub struct EmbeddingModel {
    encoder: Encoder,
    tokenizer: Tokenizer,
    device: Device,
    dim: usize,
    max_len: usize,
    pad_id: u32,
}

impl EmbeddingModel {
    pub fn load(settings: &EmbeddingSettings) -> Result<Self> {
        let device = select_device();
        let model_dir = resolve_model_dir(&settings.model_dir)?;
        info!(model_dir = %model_dir.display(), architecture = ?settings.architecture, "loading embedding model");

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;

        let config_path = model_dir.join("config.json");
        let raw_config: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&config_path).with_context(|| format!("reading {}", config_path.display()))?,
        )?;
        let dim = raw_config
            .get("hidden_size")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| anyhow!("{} has no hidden_size", config_path.display()))? as usize;

        let vb = load_weights(&model_dir, &device)?;
        let encoder = match settings.architecture {
            Architecture::Bert => {
                let cfg: BertConfig = serde_json::from_value(raw_config)?;
                Encoder::Bert(BertModel::load(vb, &cfg)?)
            }
            Architecture::XlmRoberta => {
                let cfg: XLMRobertaConfig = serde_json::from_value(raw_config)?;
                Encoder::XlmRoberta(XLMRobertaModel::new(&cfg, vb)?)
            }
        };
        let pad_id = tokenizer.get_padding().map(|p| p.pad_id).unwrap_or(match settings.architecture {
            Architecture::Bert => 0,
            Architecture::XlmRoberta => 1,
        });

        info!(dim, max_len = settings.max_len, "embedding model loaded");
        Ok(Self { encoder, tokenizer, device, dim, max_len: settings.max_len, pad_id })
    }
}

fn load_weights(model_dir: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    let safetensors = model_dir.join("model.safetensors");
    let weights: HashMap<String, Tensor> = if safetensors.exists() {
        candle_core::safetensors::load(&safetensors, device)?
    } else {
        let pickle = model_dir.join("pytorch_model.bin");
        if !pickle.exists() {
            bail!("No model.safetensors or pytorch_model.bin in {}", model_dir.display());
        }
        candle_core::pickle::read_all(&pickle)?.into_iter().collect()
    };
    debug!(tensors = weights.len(), "weights read");
    Ok(VarBuilder::from_tensors(weights, DType::F32, device))
}

impl Embedder for EmbeddingModel {
    fn dim(&self) -> usize {
        self.dim
    }

    // Two positions go to the special tokens added on encode.
    fn max_len(&self) -> usize {
        self.max_len.saturating_sub(2)
    }

    fn normalized(&self) -> bool {
        true
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let (input_ids, attention_mask) =
            tokenize_on_device(&self.tokenizer, texts, self.max_len, self.pad_id, &self.device)?;
        let hidden = self.encoder.forward(&input_ids, &attention_mask)?;
        let pooled = masked_mean_l2(&hidden, &attention_mask)?;
        let out: Vec<Vec<f32>> = pooled.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.to_vec2()?;
        let elapsed = start.elapsed();
        if elapsed.as_millis() > 100 * texts.len() as u128 {
            warn!(batch = texts.len(), ms = elapsed.as_millis() as u64, "slow embedding batch");
        }
        Ok(out)
    }
}

/// Deterministic hashing bag-of-words embedder for tests and offline runs.
///
/// Every lowercase alphanumeric word adds 1.0 to bucket `xxhash64(word) % dim`;
/// the result is L2-normalized, so texts sharing words score higher.
pub struct FakeEmbedder {
    dim: usize,
}

impl FakeEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        use std::hash::{Hash, Hasher};
        use twox_hash::XxHash64;

        let mut v = vec![0f32; self.dim];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let mut hasher = XxHash64::with_seed(0);
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() % self.dim as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Embedder for FakeEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn max_len(&self) -> usize {
        usize::MAX
    }

    fn normalized(&self) -> bool {
        true
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Fake embeddings when `use_fake` is set or `APP_USE_FAKE_EMBEDDINGS` is truthy,
/// otherwise the local model from `settings.model_dir`.
pub fn get_default_embedder(settings: &EmbeddingSettings) -> Result<Box<dyn Embedder>> {
    let env_fake = std::env::var("APP_USE_FAKE_EMBEDDINGS")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if settings.use_fake || env_fake {
        info!(dim = settings.fake_dim, "using FakeEmbedder");
        return Ok(Box::new(FakeEmbedder::new(settings.fake_dim)));
    }
    Ok(Box::new(EmbeddingModel::load(settings)?))
}

fn resolve_model_dir(configured: &str) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("APP_MODEL_DIR") {
        let p = expand_path(&dir);
        if p.exists() {
            debug!(path = %p.display(), "using APP_MODEL_DIR");
            return Ok(p);
        }
    }
    let p = expand_path(configured);
    if p.exists() {
        return Ok(p);
    }
    let parent = Path::new("..").join(&p);
    if p.is_relative() && parent.exists() {
        return Ok(parent);
    }
    Err(anyhow!("Could not locate model directory {}", p.display()))
}
