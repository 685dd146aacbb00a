use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{self, ClipTextConfig, ClipTextTransformer},
    flux::{
        autoencoder::{self, AutoEncoder},
        model::{self, Flux},
        sampling, WithForward,
    },
    t5::{self, T5EncoderModel},
};
use hf_hub::api::tokio::Api;
use image::{imageops, DynamicImage, GrayImage};
use tokenizers::Tokenizer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    image_to_tensor, select_best_device, tensor_to_image, DeviceMap, GenerationMode, Invocation,
    Loader, ModelLike, PipelineError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    fn repo(self) -> &'static str {
        match self {
            Self::Schnell => "black-forest-labs/FLUX.1-schnell",
            Self::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    fn weights(self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    fn model_config(self) -> model::Config {
        match self {
            Self::Schnell => model::Config::schnell(),
            Self::Dev => model::Config::dev(),
        }
    }

    fn autoencoder_config(self) -> autoencoder::Config {
        match self {
            Self::Schnell => autoencoder::Config::schnell(),
            Self::Dev => autoencoder::Config::dev(),
        }
    }

    /// Timesteps for `steps` iterations; `dev` shifts them by the image token count.
    fn schedule(self, steps: usize, image_seq_len: usize) -> Vec<f64> {
        match self {
            Self::Schnell => sampling::get_schedule(steps, None),
            Self::Dev => sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15))),
        }
    }
}

/// Index of the first timestep an image-to-image run starts from.
fn start_index(steps: usize, strength: f64) -> usize {
    let active = ((steps as f64 * strength).round() as usize).clamp(1, steps);
    steps - active
}

/// Maps a denoising index at or after `start` onto `0..steps`, so partial
/// runs still report progress over the full step count.
fn progress_step(index: usize, start: usize, steps: usize) -> usize {
    (index - start) * steps / (steps - start)
}

/// Packed latents that pin the unmasked region to the (re-noised) source.
struct Inpaint {
    noise: Tensor,
    source: Tensor,
    mask: Tensor,
    keep: Tensor,
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl FluxModel {
    fn encode_prompt(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(256, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&input_token_ids)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        Ok((t5_emb, clip_emb))
    }

    /// Autoencoder latents of `source`, repeated for the batch.
    fn encode_image(&self, source: &DynamicImage, batch: usize) -> Result<Tensor> {
        let pixels = image_to_tensor(source, &self.device)?.to_dtype(self.dtype)?;
        let latent = self.autoencoder.encode(&pixels.unsqueeze(0)?)?;
        Ok(latent.repeat((batch, 1, 1, 1))?)
    }

    /// Packs a pixel mask into the same token layout as the image latents.
    fn pack_mask(
        &self,
        mask: &GrayImage,
        batch: usize,
        t5_emb: &Tensor,
        clip_emb: &Tensor,
        width: usize,
        height: usize,
    ) -> Result<Tensor> {
        let latent_width = width.div_ceil(16) * 2;
        let latent_height = height.div_ceil(16) * 2;
        let resized = imageops::resize(
            mask,
            latent_width as u32,
            latent_height as u32,
            imageops::FilterType::Triangle,
        );
        let values: Vec<f32> = resized.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        let mask = Tensor::from_vec(values, (1, 1, latent_height, latent_width), &self.device)?
            .repeat((batch, 16, 1, 1))?
            .to_dtype(self.dtype)?;
        Ok(sampling::State::new(t5_emb, clip_emb, &mask)?.img)
    }

    #[allow(clippy::too_many_arguments)]
    fn denoise(
        &self,
        state: &sampling::State,
        mut img: Tensor,
        inpaint: Option<&Inpaint>,
        timesteps: &[f64],
        start: usize,
        guidance: f64,
        cancel: &CancellationToken,
        on_step: &mut dyn FnMut(usize),
    ) -> Result<Tensor> {
        let b_sz = img.dim(0)?;
        let dev = img.device().clone();
        let guidance = Tensor::full(guidance as f32, b_sz, &dev)?;
        let steps = timesteps.len() - 1;

        for (index, window) in timesteps.windows(2).enumerate().skip(start) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled.into());
            }
            on_step(progress_step(index, start, steps));

            let (t_curr, t_prev) = (window[0], window[1]);
            let t_vec = Tensor::full(t_curr as f32, b_sz, &dev)?;
            let pred = self.flux_model.forward(
                &img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &t_vec,
                &state.vec,
                Some(&guidance),
            )?;
            img = (img + pred * (t_prev - t_curr))?;

            if let Some(inpaint) = inpaint {
                let known = (inpaint.noise.affine(t_prev, 0.)? + inpaint.source.affine(1. - t_prev, 0.)?)?;
                img = (img.mul(&inpaint.mask)? + known.mul(&inpaint.keep)?)?;
            }
        }
        Ok(img)
    }

    fn generate(
        &mut self,
        invocation: &Invocation,
        on_step: &mut dyn FnMut(usize),
    ) -> Result<Vec<DynamicImage>> {
        let (width, height) = invocation.mode.dimensions();
        let batch = invocation.num_images;

        if let Some(seed) = invocation.seed {
            // Some backends cannot be seeded; their noise stays random.
            if let Err(err) = self.device.set_seed(seed) {
                warn!(seed, error = %err, "Ignoring seed");
            }
        }

        let (t5_emb, clip_emb) = self.encode_prompt(&invocation.prompt)?;
        let noise = sampling::get_noise(batch, height, width, &self.device)?.to_dtype(self.dtype)?;
        let state = sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let timesteps = self
            .variant
            .schedule(invocation.num_inference_steps, state.img.dim(1)?);

        let latent_img = match invocation.mode.as_ref() {
            GenerationMode::TextToImage { .. } => self.denoise(
                &state,
                state.img.clone(),
                None,
                &timesteps,
                0,
                invocation.guidance_scale,
                &invocation.cancel,
                on_step,
            )?,
            GenerationMode::ImageToImage {
                source,
                strength,
                mask,
            }
            | GenerationMode::Inpainting {
                source,
                strength,
                mask,
            } => {
                let source_latent = self.encode_image(source, batch)?;
                let packed_source = sampling::State::new(&t5_emb, &clip_emb, &source_latent)?.img;
                let start = start_index(invocation.num_inference_steps, *strength);
                let t_start = timesteps[start];
                let img = (state.img.affine(t_start, 0.)? + packed_source.affine(1. - t_start, 0.)?)?;

                let inpaint = match mask {
                    Some(mask) => {
                        let mask = self.pack_mask(mask, batch, &t5_emb, &clip_emb, width, height)?;
                        Some(Inpaint {
                            noise: state.img.clone(),
                            source: packed_source,
                            keep: mask.affine(-1., 1.)?,
                            mask,
                        })
                    }
                    None => None,
                };
                debug!(start, strength, masked = inpaint.is_some(), "Image-to-image");
                self.denoise(
                    &state,
                    img,
                    inpaint.as_ref(),
                    &timesteps,
                    start,
                    invocation.guidance_scale,
                    &invocation.cancel,
                    on_step,
                )?
            }
        };

        let unpacked = sampling::unpack(&latent_img, height, width)?;
        let decoded = self.autoencoder.decode(&unpacked)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;

        (0..batch).map(|i| tensor_to_image(&img.i(i)?)).collect()
    }
}

impl ModelLike for FluxModel {
    fn run(
        &mut self,
        invocation: &Invocation,
        on_step: &mut dyn FnMut(usize),
    ) -> Result<Vec<DynamicImage>, PipelineError> {
        self.generate(invocation, on_step)
            .map_err(|err| match err.downcast::<PipelineError>() {
                Ok(err) => err,
                Err(err) => PipelineError::classify(err),
            })
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;
    type Variant = FluxVariant;

    async fn load(variant: FluxVariant, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        info!(?variant, ?device, ?dtype, "Loading FLUX weights");

        // --- T5 ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Autoencoder and transformer ---
        let bf_repo = api.repo(hf_hub::Repo::model(variant.repo().to_string()));
        let autoencoder_model_file = bf_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[autoencoder_model_file],
                dtype,
                &device,
            )
            .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;

        let flux_model_file = bf_repo
            .get(variant.weights())
            .await
            .context("failed to get flux model file")?;
        let flux_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[flux_model_file], dtype, &device)
                .context("failed to build flux var builder")?
        };
        let flux_model =
            Flux::new(&variant.model_config(), flux_vb).context("failed to load flux model")?;

        info!(?variant, "FLUX weights loaded");
        Ok(FluxModel {
            variant,
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
        })
    }
}
