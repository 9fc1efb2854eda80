//! Convolutional building blocks shared by the VAE and the UNet.
use tch::{nn, nn::Module, Kind, Tensor};

/// A residual block of two group-normalized 3x3 convolutions, optionally
/// conditioned on a timestep embedding.
#[derive(Debug)]
pub struct ResnetBlock {
    norm1: nn::GroupNorm,
    conv1: nn::Conv2D,
    time_emb_proj: Option<nn::Linear>,
    norm2: nn::GroupNorm,
    conv2: nn::Conv2D,
    conv_shortcut: Option<nn::Conv2D>,
}

impl ResnetBlock {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        temb_channels: Option<i64>,
        groups: i64,
        eps: f64,
    ) -> Self {
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let norm_cfg = nn::GroupNormConfig { eps, ..Default::default() };
        let norm1 = nn::group_norm(&vs / "norm1", groups, in_channels, norm_cfg);
        let conv1 = nn::conv2d(&vs / "conv1", in_channels, out_channels, 3, conv_cfg);
        let time_emb_proj = temb_channels
            .map(|temb| nn::linear(&vs / "time_emb_proj", temb, out_channels, Default::default()));
        let norm2 = nn::group_norm(&vs / "norm2", groups, out_channels, norm_cfg);
        let conv2 = nn::conv2d(&vs / "conv2", out_channels, out_channels, 3, conv_cfg);
        let conv_shortcut = (in_channels != out_channels).then(|| {
            nn::conv2d(&vs / "conv_shortcut", in_channels, out_channels, 1, Default::default())
        });
        Self { norm1, conv1, time_emb_proj, norm2, conv2, conv_shortcut }
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> Tensor {
        let shortcut = match &self.conv_shortcut {
            Some(conv) => xs.apply(conv),
            None => xs.shallow_clone(),
        };
        let hs = xs.apply(&self.norm1).silu().apply(&self.conv1);
        let hs = match (temb, &self.time_emb_proj) {
            (Some(temb), Some(proj)) => hs + temb.silu().apply(proj).unsqueeze(-1).unsqueeze(-1),
            _ => hs,
        };
        shortcut + hs.apply(&self.norm2).silu().apply(&self.conv2)
    }
}

/// Strided 3x3 convolution halving the spatial size.
///
/// With zero padding the input is padded on the right and bottom only, which
/// is what the VAE encoder was trained with.
#[derive(Debug)]
pub struct Downsample {
    conv: nn::Conv2D,
    padding: i64,
}

impl Downsample {
    pub fn new(vs: nn::Path, channels: i64, padding: i64) -> Self {
        let conv_cfg = nn::ConvConfig { stride: 2, padding, ..Default::default() };
        let conv = nn::conv2d(&vs / "conv", channels, channels, 3, conv_cfg);
        Self { conv, padding }
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Tensor {
        if self.padding == 0 {
            xs.pad([0, 1, 0, 1], "constant", Some(0.)).apply(&self.conv)
        } else {
            xs.apply(&self.conv)
        }
    }
}

/// Nearest-neighbour upsampling followed by a 3x3 convolution.
#[derive(Debug)]
pub struct Upsample {
    conv: nn::Conv2D,
}

impl Upsample {
    pub fn new(vs: nn::Path, channels: i64) -> Self {
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        Self { conv: nn::conv2d(&vs / "conv", channels, channels, 3, conv_cfg) }
    }

    /// Doubles the spatial size unless an explicit `(height, width)` is given.
    pub fn forward(&self, xs: &Tensor, size: Option<(i64, i64)>) -> Tensor {
        let xs = match size {
            Some((h, w)) => xs.upsample_nearest2d([h, w], None, None),
            None => {
                let dims = xs.size();
                let (h, w) = (dims[2], dims[3]);
                xs.upsample_nearest2d([2 * h, 2 * w], Some(2.), Some(2.))
            }
        };
        xs.apply(&self.conv)
    }
}

/// Sinusoidal embedding of the diffusion timesteps.
pub fn timestep_embedding(
    timesteps: &Tensor,
    dim: i64,
    flip_sin_to_cos: bool,
    freq_shift: f64,
) -> Tensor {
    let half_dim = dim / 2;
    let exponent = Tensor::arange(half_dim, (Kind::Float, timesteps.device()))
        * (-f64::ln(10000.) / (half_dim as f64 - freq_shift));
    let emb = timesteps.unsqueeze(-1) * exponent.exp().unsqueeze(0);
    let emb = if flip_sin_to_cos {
        Tensor::cat(&[emb.cos(), emb.sin()], -1)
    } else {
        Tensor::cat(&[emb.sin(), emb.cos()], -1)
    };
    if dim % 2 == 1 {
        emb.pad([0, 1, 0, 0], "constant", None)
    } else {
        emb
    }
}

/// Two layer projection of the sinusoidal embedding.
#[derive(Debug)]
pub struct TimestepEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl TimestepEmbedding {
    pub fn new(vs: nn::Path, channels: i64, time_embed_dim: i64) -> Self {
        let linear_1 = nn::linear(&vs / "linear_1", channels, time_embed_dim, Default::default());
        let linear_2 =
            nn::linear(&vs / "linear_2", time_embed_dim, time_embed_dim, Default::default());
        Self { linear_1, linear_2 }
    }
}

impl Module for TimestepEmbedding {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.linear_1).silu().apply(&self.linear_2)
    }
}
