//! Query decoder hosting virtual query replay.
//!
//! Encoder stage: every memory position gets class logits and a box
//! proposal; the top-k positions by max class logit become the real queries.
//! Replay queries are appended after them while training. Inside every
//! decoder layer the replay slots skip self and cross attention and rejoin
//! the real queries before the FFN, so they never see the image.

use candle_core::{DType, Module, Tensor, D};
use candle_nn::ops::{sigmoid, softmax};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};
use simcis_core::{Error, Result};
use tracing::debug;

use crate::output::{DecoderOutput, DistillLogits, QueryLayout, ScopeOutput};
use crate::replay::ReplayBatch;

/// Configuration for the query decoder
#[derive(Debug, Clone)]
pub struct QueryDecoderConfig {
    /// Query and memory feature dimension
    pub hidden_dim: usize,
    pub n_heads: usize,
    /// FFN hidden dimension
    pub ff_dim: usize,
    pub n_layers: usize,
    pub num_classes: usize,
    /// Real queries selected from the encoder memory
    pub num_queries: usize,
    /// Add the positional embedding to replay queries at the first layer
    pub add_pos_to_replay: bool,
}

impl Default for QueryDecoderConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 256,
            n_heads: 8,
            ff_dim: 2048,
            n_layers: 9,
            num_classes: 150,
            num_queries: 100,
            add_pos_to_replay: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Train,
    Inference,
}

/// Features handed over by the pixel decoder.
#[derive(Debug, Clone)]
pub struct DecoderInput {
    /// Flattened multi-scale memory `[B, S, D]`
    pub memory: Tensor,
    /// Per-pixel mask embedding `[B, D, h, w]`
    pub mask_features: Tensor,
}

/// Multi-head attention with separate query and key/value sequences.
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(dim: usize, n_heads: usize, vb: VarBuilder) -> Result<Self> {
        if n_heads == 0 || dim % n_heads != 0 {
            return Err(Error::InvalidInput(format!(
                "hidden dim {dim} not divisible into {n_heads} heads"
            )));
        }
        Ok(Self {
            query: linear(dim, dim, vb.pp("query"))?,
            key: linear(dim, dim, vb.pp("key"))?,
            value: linear(dim, dim, vb.pp("value"))?,
            output: linear(dim, dim, vb.pp("output"))?,
            n_heads,
            head_dim: dim / n_heads,
        })
    }

    /// `q: [B, Lq, D]`, `k`, `v: [B, Lk, D]` → `[B, Lq, D]`.
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let (batch, q_len, dim) = q.dims3()?;
        let k_len = k.dim(1)?;

        let split = |x: Tensor, len: usize| -> candle_core::Result<Tensor> {
            x.reshape((batch, len, self.n_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.query.forward(q)?, q_len)?;
        let k = split(self.key.forward(k)?, k_len)?;
        let v = split(self.value.forward(v)?, k_len)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;
        let attn = softmax(&scores, 3)?;

        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, q_len, dim))?;
        Ok(self.output.forward(&out)?)
    }
}

/// Self attention, cross attention and FFN, each with residual and norm.
pub struct DecoderLayer {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    ffn1: Linear,
    ffn2: Linear,
}

impl DecoderLayer {
    pub fn new(dim: usize, n_heads: usize, ff_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(dim, n_heads, vb.pp("self_attn"))?,
            cross_attn: MultiHeadAttention::new(dim, n_heads, vb.pp("cross_attn"))?,
            norm1: layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            norm3: layer_norm(dim, 1e-5, vb.pp("norm3"))?,
            ffn1: linear(dim, ff_dim, vb.pp("ffn1"))?,
            ffn2: linear(ff_dim, dim, vb.pp("ffn2"))?,
        })
    }

    /// Self attention then cross attention to `memory`.
    pub fn attend(&self, x: &Tensor, query_pos: &Tensor, memory: &Tensor) -> Result<Tensor> {
        let with_pos = (x + query_pos)?;
        let attn_out = self.self_attn.forward(&with_pos, &with_pos, x)?;
        let x = self.norm1.forward(&(x + attn_out)?)?;

        let with_pos = (&x + query_pos)?;
        let cross_out = self.cross_attn.forward(&with_pos, memory, memory)?;
        Ok(self.norm2.forward(&(x + cross_out)?)?)
    }

    pub fn ffn(&self, x: &Tensor) -> Result<Tensor> {
        let ffn_out = self.ffn2.forward(&self.ffn1.forward(x)?.relu()?)?;
        Ok(self.norm3.forward(&(x + ffn_out)?)?)
    }
}

/// Linear stack with ReLU between layers.
struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    fn new(input: usize, hidden: usize, output: usize, depth: usize, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(depth);
        for i in 0..depth {
            let in_dim = if i == 0 { input } else { hidden };
            let out_dim = if i + 1 == depth { output } else { hidden };
            layers.push(linear(in_dim, out_dim, vb.pp(format!("layer_{i}")))?);
        }
        Ok(Self { layers })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i + 1 < self.layers.len() {
                x = x.relu()?;
            }
        }
        Ok(x)
    }
}

/// Transformer decoder with encoder-stage query selection.
pub struct QueryDecoder {
    config: QueryDecoderConfig,
    enc_output: Linear,
    enc_norm: LayerNorm,
    decoder_norm: LayerNorm,
    class_head: Linear,
    mask_head: Mlp,
    enc_box_head: Mlp,
    box_heads: Vec<Mlp>,
    ref_point_head: Mlp,
    layers: Vec<DecoderLayer>,
}

impl QueryDecoder {
    pub fn new(config: QueryDecoderConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_dim;
        if dim % 4 != 0 {
            return Err(Error::InvalidInput(format!(
                "hidden dim {dim} must be a multiple of 4"
            )));
        }
        let mut layers = Vec::with_capacity(config.n_layers);
        let mut box_heads = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            layers.push(DecoderLayer::new(
                dim,
                config.n_heads,
                config.ff_dim,
                vb.pp(format!("layer_{i}")),
            )?);
            box_heads.push(Mlp::new(dim, dim, 4, 3, vb.pp(format!("box_head_{i}")))?);
        }

        Ok(Self {
            enc_output: linear(dim, dim, vb.pp("enc_output"))?,
            enc_norm: layer_norm(dim, 1e-5, vb.pp("enc_norm"))?,
            decoder_norm: layer_norm(dim, 1e-5, vb.pp("decoder_norm"))?,
            class_head: linear(dim, config.num_classes, vb.pp("class_head"))?,
            mask_head: Mlp::new(dim, dim, dim, 3, vb.pp("mask_head"))?,
            enc_box_head: Mlp::new(dim, dim, 4, 3, vb.pp("enc_box_head"))?,
            box_heads,
            ref_point_head: Mlp::new(2 * dim, dim, dim, 2, vb.pp("ref_point_head"))?,
            layers,
            config,
        })
    }

    pub fn config(&self) -> &QueryDecoderConfig {
        &self.config
    }

    /// Run the decoder.
    ///
    /// `replay` is appended after the real queries in [`ForwardMode::Train`]
    /// only. `distill_positions` (`[B, Qd]` u32, usually the old model's
    /// proposal positions) enables the distillation branch.
    pub fn forward(
        &self,
        input: &DecoderInput,
        mode: ForwardMode,
        replay: Option<&ReplayBatch>,
        distill_positions: Option<&Tensor>,
    ) -> Result<DecoderOutput> {
        let (batch, seq_len, dim) = input.memory.dims3()?;
        let (mf_batch, mf_dim, _, _) = input.mask_features.dims4()?;
        if dim != self.config.hidden_dim || (mf_batch, mf_dim) != (batch, dim) {
            return Err(Error::ShapeMismatch {
                context: "decoder input",
                expected: vec![batch, self.config.hidden_dim],
                actual: vec![mf_batch, mf_dim],
            });
        }
        if seq_len < self.config.num_queries {
            return Err(Error::InvalidInput(format!(
                "{seq_len} memory positions for {} queries",
                self.config.num_queries
            )));
        }

        let output_memory = self
            .enc_norm
            .forward(&self.enc_output.forward(&input.memory)?)?;
        let enc_logits = self
            .class_head
            .forward(&self.decoder_norm.forward(&output_memory)?)?;
        let enc_coords = self.enc_box_head.forward(&output_memory)?;

        let positions = top_k_positions(&enc_logits, self.config.num_queries)?;
        let mut queries = gather_rows(&output_memory, &positions)?;
        let real_boxes = sigmoid(&gather_rows(&enc_coords, &positions)?)?;

        let replay = match (mode, replay) {
            (ForwardMode::Train, Some(batch_replay)) if !batch_replay.labels.is_empty() => {
                Some(batch_replay)
            }
            _ => None,
        };
        let layout = match replay {
            Some(r) => {
                let (r_batch, vq, r_dim) = r.queries.dims3()?;
                if (r_batch, r_dim) != (batch, dim) {
                    return Err(Error::ShapeMismatch {
                        context: "replay queries",
                        expected: vec![batch, vq, dim],
                        actual: r.queries.dims().to_vec(),
                    });
                }
                queries = Tensor::cat(&[&queries, &r.queries.to_dtype(queries.dtype())?], 1)?;
                debug!(vq, "appended replay queries");
                QueryLayout::with_synthetic(self.config.num_queries, r.labels.clone())?
            }
            None => QueryLayout::real_only(self.config.num_queries, batch),
        };
        let synthetic = layout.synthetic_count();

        let (interm_logits, interm_masks) = self.prediction_heads(&queries, &input.mask_features)?;
        let padded_boxes = real_boxes.pad_with_zeros(1, 0, synthetic)?;
        let interm = ScopeOutput {
            logits: interm_logits,
            masks: interm_masks,
            boxes: padded_boxes.clone(),
        };

        let mut scopes = self.run_layers(
            queries.detach(),
            padded_boxes.detach(),
            &input.memory,
            &input.mask_features,
            synthetic,
        )?;
        let primary = scopes.pop().ok_or(Error::MissingOutput("decoder layers"))?;

        let distill = match distill_positions {
            Some(positions) => Some(self.distill_branch(
                &output_memory,
                &enc_coords,
                positions,
                input,
            )?),
            None => None,
        };

        Ok(DecoderOutput {
            primary,
            aux: scopes,
            interm,
            layout,
            query_features: queries,
            proposal_positions: positions,
            distill,
        })
    }

    fn distill_branch(
        &self,
        output_memory: &Tensor,
        enc_coords: &Tensor,
        positions: &Tensor,
        input: &DecoderInput,
    ) -> Result<DistillLogits> {
        let (batch, seq_len, _) = output_memory.dims3()?;
        let (p_batch, _) = positions.dims2()?;
        if p_batch != batch {
            return Err(Error::ShapeMismatch {
                context: "distill positions",
                expected: vec![batch],
                actual: vec![p_batch],
            });
        }
        let max_position = positions.flatten_all()?.max(0)?.to_scalar::<u32>()?;
        if max_position as usize >= seq_len {
            return Err(Error::InvalidInput(format!(
                "distill position {max_position} outside {seq_len} memory positions"
            )));
        }

        let queries = gather_rows(output_memory, positions)?;
        let (interm, _) = self.prediction_heads(&queries, &input.mask_features)?;
        let refs = sigmoid(&gather_rows(enc_coords, positions)?)?.detach();
        let scopes = self.run_layers(
            queries.detach(),
            refs,
            &input.memory,
            &input.mask_features,
            0,
        )?;
        let primary = scopes
            .last()
            .map(|s| s.logits.clone())
            .ok_or(Error::MissingOutput("distill decoder layers"))?;
        Ok(DistillLogits { primary, interm })
    }

    /// Decoder layers over `[B, Qt, D]` queries whose last `synthetic` slots
    /// bypass attention. Returns one scope per layer.
    fn run_layers(
        &self,
        mut output: Tensor,
        mut refs: Tensor,
        memory: &Tensor,
        mask_features: &Tensor,
        synthetic: usize,
    ) -> Result<Vec<ScopeOutput>> {
        let total = output.dim(1)?;
        let real = total - synthetic;
        let mut scopes = Vec::with_capacity(self.layers.len());

        for (i, (layer, box_head)) in self.layers.iter().zip(&self.box_heads).enumerate() {
            let query_pos = self
                .ref_point_head
                .forward(&sine_embedding(&refs, self.config.hidden_dim)?)?;

            output = if synthetic > 0 {
                let mut replayed = output.narrow(1, real, synthetic)?;
                if self.config.add_pos_to_replay && i == 0 {
                    replayed = (replayed + query_pos.narrow(1, real, synthetic)?)?;
                }
                let attended = layer.attend(
                    &output.narrow(1, 0, real)?,
                    &query_pos.narrow(1, 0, real)?,
                    memory,
                )?;
                Tensor::cat(&[attended, replayed], 1)?
            } else {
                layer.attend(&output, &query_pos, memory)?
            };
            output = layer.ffn(&output)?;

            let (logits, masks) = self.prediction_heads(&output, mask_features)?;
            let delta = box_head.forward(&output)?;
            let boxes = sigmoid(&(delta + inverse_sigmoid(&refs)?)?)?;
            refs = boxes.detach();
            scopes.push(ScopeOutput {
                logits,
                masks,
                boxes,
            });
        }
        Ok(scopes)
    }

    /// Class logits `[B, Q, C]` and mask logits `[B, Q, h, w]`.
    fn prediction_heads(&self, x: &Tensor, mask_features: &Tensor) -> Result<(Tensor, Tensor)> {
        let normed = self.decoder_norm.forward(x)?;
        let logits = self.class_head.forward(&normed)?;

        let (batch, queries, _) = normed.dims3()?;
        let (_, dim, h, w) = mask_features.dims4()?;
        let mask_embed = self.mask_head.forward(&normed)?;
        let masks = mask_embed
            .matmul(&mask_features.reshape((batch, dim, h * w))?)?
            .reshape((batch, queries, h, w))?;
        Ok((logits, masks))
    }
}

/// Top-k memory positions per image by max class logit, `[B, k]` u32.
fn top_k_positions(logits: &Tensor, k: usize) -> Result<Tensor> {
    let (batch, _, _) = logits.dims3()?;
    let scores: Vec<Vec<f32>> = logits
        .detach()
        .max(D::Minus1)?
        .to_dtype(DType::F32)?
        .to_vec2()?;

    let mut data = Vec::with_capacity(batch * k);
    for row in &scores {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
        data.extend(order.into_iter().take(k).map(|p| p as u32));
    }
    Ok(Tensor::from_vec(data, (batch, k), logits.device())?)
}

/// Rows of `[B, S, K]` at `[B, Q]` positions, giving `[B, Q, K]`.
fn gather_rows(x: &Tensor, positions: &Tensor) -> Result<Tensor> {
    let (batch, _, width) = x.dims3()?;
    let (_, queries) = positions.dims2()?;
    let index = positions
        .unsqueeze(2)?
        .broadcast_as((batch, queries, width))?
        .contiguous()?;
    Ok(x.contiguous()?.gather(&index, 1)?)
}

fn inverse_sigmoid(x: &Tensor) -> Result<Tensor> {
    const EPS: f64 = 1e-5;
    let x = x.clamp(0.0, 1.0)?;
    let numerator = x.clamp(EPS, 1.0)?;
    let denominator = x.affine(-1.0, 1.0)?.clamp(EPS, 1.0)?;
    Ok((numerator / denominator)?.log()?)
}

/// Sinusoidal embedding of `[B, Q, 4]` boxes, `[B, Q, 2 * dim]`.
///
/// Each coordinate gets `dim / 2` channels alternating sine and cosine;
/// coordinates are laid out as `(cy, cx, w, h)`.
pub fn sine_embedding(boxes: &Tensor, dim: usize) -> Result<Tensor> {
    let feats = dim / 2;
    let device = boxes.device();
    let scale = 2.0 * std::f64::consts::PI;

    let inv_freq: Vec<f32> = (0..feats)
        .map(|i| {
            let exponent = 2.0 * (i / 2) as f64 / feats as f64;
            (1.0 / 10000f64.powf(exponent)) as f32
        })
        .collect();
    let parity: Vec<f32> = (0..feats).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
    let inv_freq = Tensor::from_vec(inv_freq, feats, device)?.to_dtype(boxes.dtype())?;
    let even = Tensor::from_vec(parity, feats, device)?.to_dtype(boxes.dtype())?;
    let odd = even.affine(-1.0, 1.0)?;

    let embed = |coord: usize| -> Result<Tensor> {
        let angle = (boxes.narrow(D::Minus1, coord, 1)? * scale)?.broadcast_mul(&inv_freq)?;
        Ok((angle.sin()?.broadcast_mul(&even)? + angle.cos()?.broadcast_mul(&odd)?)?)
    };
    Ok(Tensor::cat(&[embed(1)?, embed(0)?, embed(2)?, embed(3)?], D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn small_config() -> QueryDecoderConfig {
        QueryDecoderConfig {
            hidden_dim: 16,
            n_heads: 4,
            ff_dim: 32,
            n_layers: 3,
            num_classes: 6,
            num_queries: 5,
            add_pos_to_replay: false,
        }
    }

    fn input(batch: usize, device: &Device) -> Result<DecoderInput> {
        Ok(DecoderInput {
            memory: Tensor::randn(0f32, 1.0, (batch, 20, 16), device)?,
            mask_features: Tensor::randn(0f32, 1.0, (batch, 16, 4, 4), device)?,
        })
    }

    fn replay(batch: usize, vq: usize, device: &Device) -> Result<ReplayBatch> {
        Ok(ReplayBatch {
            queries: Tensor::randn(0f32, 1.0, (batch, vq, 16), device)?,
            labels: vec![vec![1; vq]; batch],
        })
    }

    #[test]
    fn test_attention_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MultiHeadAttention::new(16, 4, vb)?;

        let q = Tensor::zeros((2, 3, 16), DType::F32, &device)?;
        let kv = Tensor::zeros((2, 7, 16), DType::F32, &device)?;
        assert_eq!(attn.forward(&q, &kv, &kv)?.dims(), &[2, 3, 16]);
        Ok(())
    }

    #[test]
    fn test_training_forward_appends_replay() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = QueryDecoder::new(small_config(), vb)?;

        let out = decoder.forward(
            &input(2, &device)?,
            ForwardMode::Train,
            Some(&replay(2, 3, &device)?),
            None,
        )?;
        assert_eq!(out.primary.logits.dims(), &[2, 8, 6]);
        assert_eq!(out.primary.masks.dims(), &[2, 8, 4, 4]);
        assert_eq!(out.aux.len(), 2);
        assert_eq!(out.interm.boxes.dims(), &[2, 8, 4]);
        assert_eq!(out.query_features.dims(), &[2, 8, 16]);
        assert_eq!(out.proposal_positions.dims(), &[2, 5]);
        assert_eq!(out.layout.synthetic_count(), 3);
        assert!(out.distill.is_none());

        // Replay slots carry zero interm boxes.
        let synthetic_boxes: f32 = out.interm.boxes.narrow(1, 5, 3)?.abs()?.sum_all()?.to_scalar()?;
        assert_eq!(synthetic_boxes, 0.0);
        Ok(())
    }

    #[test]
    fn test_inference_never_injects() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = QueryDecoder::new(small_config(), vb)?;

        let out = decoder.forward(
            &input(1, &device)?,
            ForwardMode::Inference,
            Some(&replay(1, 3, &device)?),
            None,
        )?;
        assert_eq!(out.primary.logits.dims(), &[1, 5, 6]);
        assert!(!out.layout.has_synthetic());
        Ok(())
    }

    #[test]
    fn test_replay_slots_ignore_the_image() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = QueryDecoder::new(small_config(), vb)?;
        let replay = replay(1, 2, &device)?;

        let first = input(1, &device)?;
        let second = DecoderInput {
            memory: Tensor::randn(0f32, 1.0, (1, 20, 16), &device)?,
            mask_features: first.mask_features.clone(),
        };
        let a = decoder.forward(&first, ForwardMode::Train, Some(&replay), None)?;
        let b = decoder.forward(&second, ForwardMode::Train, Some(&replay), None)?;

        let diff = (a.primary.logits.narrow(1, 5, 2)? - b.primary.logits.narrow(1, 5, 2)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_distill_branch() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = QueryDecoder::new(small_config(), vb)?;
        let input = input(2, &device)?;

        let old = decoder.forward(&input, ForwardMode::Inference, None, None)?;
        let out = decoder.forward(
            &input,
            ForwardMode::Train,
            None,
            Some(&old.proposal_positions),
        )?;
        let distill = out.distill.ok_or(Error::MissingOutput("distill"))?;
        assert_eq!(distill.primary.dims(), &[2, 5, 6]);
        assert_eq!(distill.interm.dims(), &[2, 5, 6]);

        let bad = Tensor::from_vec(vec![25u32; 10], (2, 5), &device)?;
        let err = decoder
            .forward(&input, ForwardMode::Train, None, Some(&bad))
            .unwrap_err();
        assert!(err.is_precondition());
        Ok(())
    }

    #[test]
    fn test_sine_embedding_at_origin() -> Result<()> {
        let device = Device::Cpu;
        let boxes = Tensor::zeros((1, 1, 4), DType::F32, &device)?;
        let embed: Vec<f32> = sine_embedding(&boxes, 8)?.flatten_all()?.to_vec1()?;
        assert_eq!(embed.len(), 16);
        for (i, v) in embed.iter().enumerate() {
            let expected = if i % 2 == 0 { 0.0 } else { 1.0 };
            assert!((v - expected).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_top_k_positions() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[0.1f32, 0.0], [3.0, 0.0], [0.0, 2.0]]], &device)?;
        let positions: Vec<Vec<u32>> = top_k_positions(&logits, 2)?.to_vec2()?;
        assert_eq!(positions, vec![vec![1, 2]]);
        Ok(())
    }
}
