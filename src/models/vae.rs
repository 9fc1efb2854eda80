//! # Variational Auto-Encoder (VAE) Models.
//!
//! The encoder compresses an image into a distribution over a smaller latent
//! space, the decoder expands sampled latents back into an image. Both halves
//! are separate models with their own parameters so that they can be loaded,
//! placed and dropped independently.
use crate::models::attention::VaeAttention;
use crate::models::layers::{Downsample, ResnetBlock, Upsample};
use tch::{nn, nn::Module, Tensor};

const NORM_EPS: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct AutoEncoderConfig {
    pub block_out_channels: Vec<i64>,
    pub layers_per_block: i64,
    pub latent_channels: i64,
    pub norm_num_groups: i64,
    /// Channels of the images, 3 for RGB.
    pub image_channels: i64,
}

impl AutoEncoderConfig {
    // https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/vae/config.json
    pub fn v1_5() -> Self {
        Self {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
            image_channels: 3,
        }
    }

    fn last_channels(&self) -> i64 {
        *self.block_out_channels.last().unwrap()
    }
}

/// resnet, attention, resnet at the lowest resolution.
#[derive(Debug)]
struct MidBlock {
    first: ResnetBlock,
    attention: VaeAttention,
    second: ResnetBlock,
}

impl MidBlock {
    fn new(vs: nn::Path, channels: i64, groups: i64) -> Self {
        let vs_resnets = &vs / "resnets";
        let first = ResnetBlock::new(&vs_resnets / 0, channels, channels, None, groups, NORM_EPS);
        let attention = VaeAttention::new(&vs / "attentions" / 0, channels, groups, NORM_EPS);
        let second = ResnetBlock::new(&vs_resnets / 1, channels, channels, None, groups, NORM_EPS);
        Self { first, attention, second }
    }
}

impl Module for MidBlock {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let xs = self.first.forward(xs, None).apply(&self.attention);
        self.second.forward(&xs, None)
    }
}

#[derive(Debug)]
struct EncoderBlock {
    resnets: Vec<ResnetBlock>,
    downsampler: Option<Downsample>,
}

impl Module for EncoderBlock {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let mut xs = xs.shallow_clone();
        for resnet in self.resnets.iter() {
            xs = resnet.forward(&xs, None)
        }
        match &self.downsampler {
            Some(downsampler) => xs.apply(downsampler),
            None => xs,
        }
    }
}

/// Diagonal gaussian over the latent space returned by [`Encoder::encode`].
#[derive(Debug)]
pub struct LatentDistribution {
    pub mean: Tensor,
    pub std: Tensor,
}

impl LatentDistribution {
    fn new(parameters: &Tensor) -> Self {
        let chunks = parameters.chunk(2, 1);
        let logvar = chunks[1].clamp(-30., 20.);
        let std = (logvar * 0.5).exp();
        Self { mean: chunks[0].shallow_clone(), std }
    }

    pub fn sample(&self) -> Tensor {
        &self.mean + &self.std * Tensor::randn_like(&self.mean)
    }
}

/// The VAE encoder, including the `quant_conv` projection to the moments of
/// the latent distribution.
#[derive(Debug)]
pub struct Encoder {
    conv_in: nn::Conv2D,
    down_blocks: Vec<EncoderBlock>,
    mid_block: MidBlock,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
    quant_conv: nn::Conv2D,
}

impl Encoder {
    pub fn new(vs: nn::Path, config: &AutoEncoderConfig) -> Self {
        let channels = &config.block_out_channels;
        let groups = config.norm_num_groups;
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(&vs / "conv_in", config.image_channels, channels[0], 3, conv_cfg);
        let vs_down = &vs / "down_blocks";
        let down_blocks = (0..channels.len())
            .map(|i| {
                let vs_block = &vs_down / i;
                let out_channels = channels[i];
                let resnets = (0..config.layers_per_block)
                    .map(|j| {
                        let in_channels = match (i, j) {
                            (_, j) if j > 0 => out_channels,
                            (0, _) => channels[0],
                            (i, _) => channels[i - 1],
                        };
                        let vs = &vs_block / "resnets" / j;
                        ResnetBlock::new(vs, in_channels, out_channels, None, groups, NORM_EPS)
                    })
                    .collect();
                let downsampler = (i + 1 < channels.len())
                    .then(|| Downsample::new(&vs_block / "downsamplers" / 0, out_channels, 0));
                EncoderBlock { resnets, downsampler }
            })
            .collect();
        let last = config.last_channels();
        let mid_block = MidBlock::new(&vs / "mid_block", last, groups);
        let norm_cfg = nn::GroupNormConfig { eps: NORM_EPS, ..Default::default() };
        let conv_norm_out = nn::group_norm(&vs / "conv_norm_out", groups, last, norm_cfg);
        let moments = 2 * config.latent_channels;
        let conv_out = nn::conv2d(&vs / "conv_out", last, moments, 3, conv_cfg);
        let quant_conv = nn::conv2d(&vs / "quant_conv", moments, moments, 1, Default::default());
        Self { conv_in, down_blocks, mid_block, conv_norm_out, conv_out, quant_conv }
    }

    /// Returns the distribution in the latent space.
    pub fn encode(&self, xs: &Tensor) -> LatentDistribution {
        let mut xs = xs.apply(&self.conv_in);
        for block in self.down_blocks.iter() {
            xs = xs.apply(block)
        }
        let parameters = xs
            .apply(&self.mid_block)
            .apply(&self.conv_norm_out)
            .silu()
            .apply(&self.conv_out)
            .apply(&self.quant_conv);
        LatentDistribution::new(&parameters)
    }
}

#[derive(Debug)]
struct DecoderBlock {
    resnets: Vec<ResnetBlock>,
    upsampler: Option<Upsample>,
}

impl Module for DecoderBlock {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let mut xs = xs.shallow_clone();
        for resnet in self.resnets.iter() {
            xs = resnet.forward(&xs, None)
        }
        match &self.upsampler {
            Some(upsampler) => upsampler.forward(&xs, None),
            None => xs,
        }
    }
}

/// The VAE decoder, including the `post_quant_conv` applied to the latents.
#[derive(Debug)]
pub struct Decoder {
    post_quant_conv: nn::Conv2D,
    conv_in: nn::Conv2D,
    mid_block: MidBlock,
    up_blocks: Vec<DecoderBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
}

impl Decoder {
    pub fn new(vs: nn::Path, config: &AutoEncoderConfig) -> Self {
        let latent = config.latent_channels;
        let groups = config.norm_num_groups;
        let reversed: Vec<i64> = config.block_out_channels.iter().rev().copied().collect();
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let post_quant_conv =
            nn::conv2d(&vs / "post_quant_conv", latent, latent, 1, Default::default());
        let conv_in = nn::conv2d(&vs / "conv_in", latent, reversed[0], 3, conv_cfg);
        let mid_block = MidBlock::new(&vs / "mid_block", reversed[0], groups);
        let vs_up = &vs / "up_blocks";
        let up_blocks = (0..reversed.len())
            .map(|i| {
                let vs_block = &vs_up / i;
                let out_channels = reversed[i];
                let prev_channels = if i > 0 { reversed[i - 1] } else { reversed[0] };
                let resnets = (0..config.layers_per_block + 1)
                    .map(|j| {
                        let in_channels = if j == 0 { prev_channels } else { out_channels };
                        let vs = &vs_block / "resnets" / j;
                        ResnetBlock::new(vs, in_channels, out_channels, None, groups, NORM_EPS)
                    })
                    .collect();
                let upsampler = (i + 1 < reversed.len())
                    .then(|| Upsample::new(&vs_block / "upsamplers" / 0, out_channels));
                DecoderBlock { resnets, upsampler }
            })
            .collect();
        let first = config.block_out_channels[0];
        let norm_cfg = nn::GroupNormConfig { eps: NORM_EPS, ..Default::default() };
        let conv_norm_out = nn::group_norm(&vs / "conv_norm_out", groups, first, norm_cfg);
        let conv_out = nn::conv2d(&vs / "conv_out", first, config.image_channels, 3, conv_cfg);
        Self { post_quant_conv, conv_in, mid_block, up_blocks, conv_norm_out, conv_out }
    }

    /// Takes as input some sampled latents.
    pub fn decode(&self, xs: &Tensor) -> Tensor {
        let mut xs = xs.apply(&self.post_quant_conv).apply(&self.conv_in).apply(&self.mid_block);
        for block in self.up_blocks.iter() {
            xs = xs.apply(block)
        }
        xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn tiny() -> AutoEncoderConfig {
        AutoEncoderConfig {
            block_out_channels: vec![32, 64],
            layers_per_block: 1,
            latent_channels: 4,
            norm_num_groups: 32,
            image_channels: 3,
        }
    }

    #[test]
    fn encode_decode_shapes() {
        let vs_enc = nn::VarStore::new(Device::Cpu);
        let vs_dec = nn::VarStore::new(Device::Cpu);
        let encoder = Encoder::new(vs_enc.root(), &tiny());
        let decoder = Decoder::new(vs_dec.root(), &tiny());
        let image = Tensor::randn([1, 3, 16, 16], (Kind::Float, Device::Cpu));
        let dist = encoder.encode(&image);
        assert_eq!(dist.mean.size(), [1, 4, 8, 8]);
        let latents = dist.sample();
        assert_eq!(decoder.decode(&latents).size(), [1, 3, 16, 16]);
    }

    #[test]
    fn halves_have_disjoint_parameters() {
        let vs_enc = nn::VarStore::new(Device::Cpu);
        let vs_dec = nn::VarStore::new(Device::Cpu);
        let _ = Encoder::new(vs_enc.root(), &tiny());
        let _ = Decoder::new(vs_dec.root(), &tiny());
        let enc = vs_enc.variables();
        let dec = vs_dec.variables();
        assert!(enc.contains_key("quant_conv.weight"));
        assert!(enc.contains_key("down_blocks.0.downsamplers.0.conv.weight"));
        assert!(enc.contains_key("mid_block.attentions.0.group_norm.weight"));
        assert!(!enc.contains_key("down_blocks.1.downsamplers.0.conv.weight"));
        assert!(dec.contains_key("post_quant_conv.weight"));
        assert!(dec.contains_key("up_blocks.0.resnets.1.conv1.weight"));
        assert!(dec.contains_key("up_blocks.1.resnets.0.conv_shortcut.weight"));
        assert!(!dec.contains_key("up_blocks.1.upsamplers.0.conv.weight"));
    }
}
