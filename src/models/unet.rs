//! # Conditional 2D UNet
//!
//! Predicts the noise in a latent sample given the diffusion timestep and the
//! text embeddings produced by the CLIP transformer. Every resolution level is
//! a stack of residual blocks, interleaved with spatial transformers on the
//! levels that use cross-attention.
use crate::models::attention::SpatialTransformer;
use crate::models::layers::{
    timestep_embedding, Downsample, ResnetBlock, TimestepEmbedding, Upsample,
};
use tch::{nn, Kind, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    pub out_channels: i64,
    pub use_cross_attn: bool,
    /// Number of attention heads on this level.
    pub attention_head_dim: i64,
}

#[derive(Debug, Clone)]
pub struct UNetConfig {
    pub in_channels: i64,
    pub out_channels: i64,
    pub blocks: Vec<BlockConfig>,
    pub layers_per_block: i64,
    pub downsample_padding: i64,
    pub norm_num_groups: i64,
    pub norm_eps: f64,
    pub cross_attention_dim: i64,
    pub transformer_depth: i64,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
}

impl UNetConfig {
    // https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/unet/config.json
    pub fn v1_5() -> Self {
        let bc = |out_channels, use_cross_attn| BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim: 8,
        };
        Self {
            in_channels: 4,
            out_channels: 4,
            blocks: vec![bc(320, true), bc(640, true), bc(1280, true), bc(1280, false)],
            layers_per_block: 2,
            downsample_padding: 1,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim: 768,
            transformer_depth: 1,
            flip_sin_to_cos: true,
            freq_shift: 0.,
        }
    }

    fn time_embed_dim(&self) -> i64 {
        self.blocks[0].out_channels * 4
    }
}

/// One resolution level on the way down, the attention list is empty on
/// levels without cross-attention.
#[derive(Debug)]
struct DownBlock {
    resnets: Vec<ResnetBlock>,
    attentions: Vec<SpatialTransformer>,
    downsampler: Option<Downsample>,
}

impl DownBlock {
    fn forward(&self, xs: &Tensor, temb: &Tensor, context: &Tensor) -> (Tensor, Vec<Tensor>) {
        let mut xs = xs.shallow_clone();
        let mut res_xs = vec![];
        for (i, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, Some(temb));
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, context)
            }
            res_xs.push(xs.shallow_clone());
        }
        if let Some(downsampler) = &self.downsampler {
            xs = xs.apply(downsampler);
            res_xs.push(xs.shallow_clone());
        }
        (xs, res_xs)
    }
}

#[derive(Debug)]
struct UpBlock {
    resnets: Vec<ResnetBlock>,
    attentions: Vec<SpatialTransformer>,
    upsampler: Option<Upsample>,
}

impl UpBlock {
    fn forward(
        &self,
        xs: &Tensor,
        res_xs: &mut Vec<Tensor>,
        temb: &Tensor,
        context: &Tensor,
        upsample_size: Option<(i64, i64)>,
    ) -> Tensor {
        let mut xs = xs.shallow_clone();
        for (i, resnet) in self.resnets.iter().enumerate() {
            if let Some(skip) = res_xs.pop() {
                xs = Tensor::cat(&[&xs, &skip], 1);
            }
            xs = resnet.forward(&xs, Some(temb));
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, context)
            }
        }
        match &self.upsampler {
            Some(upsampler) => upsampler.forward(&xs, upsample_size),
            None => xs,
        }
    }
}

#[derive(Debug)]
struct MidBlock {
    first: ResnetBlock,
    attention: SpatialTransformer,
    second: ResnetBlock,
}

#[derive(Debug)]
pub struct UNet2DConditionModel {
    conv_in: nn::Conv2D,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: MidBlock,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
    config: UNetConfig,
}

impl UNet2DConditionModel {
    pub fn new(vs: nn::Path, config: UNetConfig) -> Self {
        let blocks = &config.blocks;
        let n_blocks = blocks.len();
        let layers = config.layers_per_block;
        let groups = config.norm_num_groups;
        let eps = config.norm_eps;
        let b_channels = blocks[0].out_channels;
        let temb = config.time_embed_dim();
        let transformer = |vs: nn::Path, channels: i64, heads: i64| {
            let context_dim = config.cross_attention_dim;
            SpatialTransformer::new(vs, channels, heads, context_dim, groups, config.transformer_depth)
        };

        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(&vs / "conv_in", config.in_channels, b_channels, 3, conv_cfg);
        let time_embedding = TimestepEmbedding::new(&vs / "time_embedding", b_channels, temb);

        let vs_down = &vs / "down_blocks";
        let down_blocks = blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let vs_block = &vs_down / i;
                let out = block.out_channels;
                let first_in = if i > 0 { blocks[i - 1].out_channels } else { b_channels };
                let resnets = (0..layers)
                    .map(|j| {
                        let in_channels = if j == 0 { first_in } else { out };
                        let vs = &vs_block / "resnets" / j;
                        ResnetBlock::new(vs, in_channels, out, Some(temb), groups, eps)
                    })
                    .collect();
                let attentions = if block.use_cross_attn {
                    let vs_attn = &vs_block / "attentions";
                    (0..layers).map(|j| transformer(&vs_attn / j, out, block.attention_head_dim)).collect()
                } else {
                    vec![]
                };
                let downsampler = (i + 1 < n_blocks).then(|| {
                    Downsample::new(&vs_block / "downsamplers" / 0, out, config.downsample_padding)
                });
                DownBlock { resnets, attentions, downsampler }
            })
            .collect();

        let last = blocks[n_blocks - 1];
        let mid_block = {
            let vs_mid = &vs / "mid_block";
            let channels = last.out_channels;
            let vs_resnets = &vs_mid / "resnets";
            MidBlock {
                first: ResnetBlock::new(&vs_resnets / 0, channels, channels, Some(temb), groups, eps),
                attention: transformer(&vs_mid / "attentions" / 0, channels, last.attention_head_dim),
                second: ResnetBlock::new(&vs_resnets / 1, channels, channels, Some(temb), groups, eps),
            }
        };

        // Up level i mirrors down level n_blocks - 1 - i. Its residual blocks
        // consume the skip connections pushed on the way down, the last of
        // them comes from the level below.
        let vs_up = &vs / "up_blocks";
        let up_blocks = (0..n_blocks)
            .map(|i| {
                let vs_block = &vs_up / i;
                let block = blocks[n_blocks - 1 - i];
                let out = block.out_channels;
                let prev_out = if i > 0 { blocks[n_blocks - i].out_channels } else { out };
                let skip_in = blocks[(n_blocks - 1 - i).saturating_sub(1)].out_channels;
                let skip_in = if i == n_blocks - 1 { b_channels } else { skip_in };
                let resnets = (0..layers + 1)
                    .map(|j| {
                        let res_skip = if j == layers { skip_in } else { out };
                        let in_channels = if j == 0 { prev_out } else { out };
                        let vs = &vs_block / "resnets" / j;
                        ResnetBlock::new(vs, in_channels + res_skip, out, Some(temb), groups, eps)
                    })
                    .collect();
                let attentions = if block.use_cross_attn {
                    let vs_attn = &vs_block / "attentions";
                    (0..layers + 1)
                        .map(|j| transformer(&vs_attn / j, out, block.attention_head_dim))
                        .collect()
                } else {
                    vec![]
                };
                let upsampler =
                    (i + 1 < n_blocks).then(|| Upsample::new(&vs_block / "upsamplers" / 0, out));
                UpBlock { resnets, attentions, upsampler }
            })
            .collect();

        let norm_cfg = nn::GroupNormConfig { eps, ..Default::default() };
        let conv_norm_out = nn::group_norm(&vs / "conv_norm_out", groups, b_channels, norm_cfg);
        let conv_out = nn::conv2d(&vs / "conv_out", b_channels, config.out_channels, 3, conv_cfg);
        Self {
            conv_in,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            config,
        }
    }

    pub fn forward(&self, xs: &Tensor, timestep: f64, encoder_hidden_states: &Tensor) -> Tensor {
        let dims = xs.size();
        let (bsize, height, width) = (dims[0], dims[2], dims[3]);
        let n_blocks = self.config.blocks.len();
        let up_factor = 2i64.pow(n_blocks as u32 - 1);
        let forward_upsample_size = height % up_factor != 0 || width % up_factor != 0;
        let context = encoder_hidden_states;

        let timesteps = Tensor::ones([bsize], (Kind::Float, xs.device())) * timestep;
        let temb = timestep_embedding(
            &timesteps,
            self.config.blocks[0].out_channels,
            self.config.flip_sin_to_cos,
            self.config.freq_shift,
        )
        .apply(&self.time_embedding);

        let mut xs = xs.apply(&self.conv_in);
        let mut res_xs = vec![xs.shallow_clone()];
        for block in self.down_blocks.iter() {
            let (out, block_res) = block.forward(&xs, &temb, context);
            res_xs.extend(block_res);
            xs = out;
        }

        let mid = &self.mid_block;
        xs = mid.first.forward(&xs, Some(&temb));
        xs = mid.attention.forward(&xs, context);
        xs = mid.second.forward(&xs, Some(&temb));

        for (i, block) in self.up_blocks.iter().enumerate() {
            let remaining = res_xs.len().saturating_sub(block.resnets.len());
            let upsample_size = match res_xs.get(remaining.wrapping_sub(1)) {
                Some(next) if forward_upsample_size && i + 1 < n_blocks => {
                    let size = next.size();
                    Some((size[2], size[3]))
                }
                _ => None,
            };
            xs = block.forward(&xs, &mut res_xs, &temb, context, upsample_size);
        }

        xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out)
    }
}
