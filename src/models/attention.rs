//! Attention Based Building Blocks
use tch::{nn, nn::Module, Kind, Tensor};

/// Single-head self attention over the pixels of a feature map, used in the
/// middle of the VAE.
#[derive(Debug)]
pub struct VaeAttention {
    group_norm: nn::GroupNorm,
    query: nn::Linear,
    key: nn::Linear,
    value: nn::Linear,
    proj_attn: nn::Linear,
    scale: f64,
}

impl VaeAttention {
    pub fn new(vs: nn::Path, channels: i64, groups: i64, eps: f64) -> Self {
        let norm_cfg = nn::GroupNormConfig { eps, ..Default::default() };
        let group_norm = nn::group_norm(&vs / "group_norm", groups, channels, norm_cfg);
        let query = nn::linear(&vs / "query", channels, channels, Default::default());
        let key = nn::linear(&vs / "key", channels, channels, Default::default());
        let value = nn::linear(&vs / "value", channels, channels, Default::default());
        let proj_attn = nn::linear(&vs / "proj_attn", channels, channels, Default::default());
        let scale = 1. / (channels as f64).sqrt();
        Self { group_norm, query, key, value, proj_attn, scale }
    }
}

impl Module for VaeAttention {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let dims = xs.size();
        let (b, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        // (b, h * w, c)
        let hs = xs.apply(&self.group_norm).view((b, c, h * w)).transpose(1, 2);
        let q = hs.apply(&self.query);
        let k = hs.apply(&self.key);
        let v = hs.apply(&self.value);
        let attn = (q.matmul(&k.transpose(-1, -2)) * self.scale).softmax(-1, Kind::Float);
        let hs = attn.matmul(&v).apply(&self.proj_attn).transpose(1, 2).reshape([b, c, h, w]);
        hs + xs
    }
}

/// Multi-head attention of the UNet feature tokens over themselves or over
/// the text embeddings.
#[derive(Debug)]
struct CrossAttention {
    to_q: nn::Linear,
    to_k: nn::Linear,
    to_v: nn::Linear,
    to_out: nn::Linear,
    heads: i64,
    scale: f64,
}

impl CrossAttention {
    fn new(vs: nn::Path, query_dim: i64, context_dim: i64, heads: i64, dim_head: i64) -> Self {
        let no_bias = nn::LinearConfig { bias: false, ..Default::default() };
        let inner_dim = heads * dim_head;
        let to_q = nn::linear(&vs / "to_q", query_dim, inner_dim, no_bias);
        let to_k = nn::linear(&vs / "to_k", context_dim, inner_dim, no_bias);
        let to_v = nn::linear(&vs / "to_v", context_dim, inner_dim, no_bias);
        let to_out = nn::linear(&vs / "to_out" / 0, inner_dim, query_dim, Default::default());
        let scale = 1. / (dim_head as f64).sqrt();
        Self { to_q, to_k, to_v, to_out, heads, scale }
    }

    // (b, n, heads * d) -> (b, heads, n, d)
    fn split_heads(&self, xs: &Tensor) -> Tensor {
        let dims = xs.size();
        xs.view((dims[0], dims[1], self.heads, -1)).transpose(1, 2)
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Tensor {
        let dims = xs.size();
        let context = context.unwrap_or(xs);
        let q = self.split_heads(&xs.apply(&self.to_q));
        let k = self.split_heads(&context.apply(&self.to_k));
        let v = self.split_heads(&context.apply(&self.to_v));
        let attn = (q.matmul(&k.transpose(-1, -2)) * self.scale).softmax(-1, Kind::Float);
        attn.matmul(&v).transpose(1, 2).reshape([dims[0], dims[1], -1]).apply(&self.to_out)
    }
}

/// GEGLU feed-forward, `net.0` gates and `net.2` projects back.
#[derive(Debug)]
struct FeedForward {
    proj: nn::Linear,
    out: nn::Linear,
}

impl FeedForward {
    fn new(vs: nn::Path, dim: i64, mult: i64) -> Self {
        let inner_dim = dim * mult;
        let vs = &vs / "net";
        let proj = nn::linear(&vs / 0 / "proj", dim, inner_dim * 2, Default::default());
        let out = nn::linear(&vs / 2, inner_dim, dim, Default::default());
        Self { proj, out }
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let chunks = xs.apply(&self.proj).chunk(2, -1);
        (&chunks[0] * chunks[1].gelu("none")).apply(&self.out)
    }
}

#[derive(Debug)]
struct TransformerBlock {
    attn1: CrossAttention,
    ff: FeedForward,
    attn2: CrossAttention,
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    norm3: nn::LayerNorm,
}

impl TransformerBlock {
    fn new(vs: nn::Path, dim: i64, heads: i64, dim_head: i64, context_dim: i64) -> Self {
        let attn1 = CrossAttention::new(&vs / "attn1", dim, dim, heads, dim_head);
        let ff = FeedForward::new(&vs / "ff", dim, 4);
        let attn2 = CrossAttention::new(&vs / "attn2", dim, context_dim, heads, dim_head);
        let norm1 = nn::layer_norm(&vs / "norm1", vec![dim], Default::default());
        let norm2 = nn::layer_norm(&vs / "norm2", vec![dim], Default::default());
        let norm3 = nn::layer_norm(&vs / "norm3", vec![dim], Default::default());
        Self { attn1, ff, attn2, norm1, norm2, norm3 }
    }

    fn forward(&self, xs: &Tensor, context: &Tensor) -> Tensor {
        let xs = self.attn1.forward(&xs.apply(&self.norm1), None) + xs;
        let xs = self.attn2.forward(&xs.apply(&self.norm2), Some(context)) + xs;
        xs.apply(&self.norm3).apply(&self.ff) + xs
    }
}

/// Transformer applied to the pixels of a feature map, with 1x1 convolution
/// projections in and out (aka Transformer2DModel).
#[derive(Debug)]
pub struct SpatialTransformer {
    norm: nn::GroupNorm,
    proj_in: nn::Conv2D,
    transformer_blocks: Vec<TransformerBlock>,
    proj_out: nn::Conv2D,
}

impl SpatialTransformer {
    pub fn new(
        vs: nn::Path,
        channels: i64,
        heads: i64,
        context_dim: i64,
        groups: i64,
        depth: i64,
    ) -> Self {
        let dim_head = channels / heads;
        let inner_dim = heads * dim_head;
        let norm_cfg = nn::GroupNormConfig { eps: 1e-6, ..Default::default() };
        let norm = nn::group_norm(&vs / "norm", groups, channels, norm_cfg);
        let proj_in = nn::conv2d(&vs / "proj_in", channels, inner_dim, 1, Default::default());
        let vs_blocks = &vs / "transformer_blocks";
        let transformer_blocks = (0..depth)
            .map(|i| TransformerBlock::new(&vs_blocks / i, inner_dim, heads, dim_head, context_dim))
            .collect();
        let proj_out = nn::conv2d(&vs / "proj_out", inner_dim, channels, 1, Default::default());
        Self { norm, proj_in, transformer_blocks, proj_out }
    }

    pub fn forward(&self, xs: &Tensor, context: &Tensor) -> Tensor {
        let dims = xs.size();
        let (b, h, w) = (dims[0], dims[2], dims[3]);
        let hs = xs.apply(&self.norm).apply(&self.proj_in);
        let inner_dim = hs.size()[1];
        let mut hs = hs.permute([0, 2, 3, 1]).reshape([b, h * w, inner_dim]);
        for block in self.transformer_blocks.iter() {
            hs = block.forward(&hs, context)
        }
        let hs = hs.reshape([b, h, w, inner_dim]).permute([0, 3, 1, 2]).apply(&self.proj_out);
        hs + xs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn spatial_transformer_keeps_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let st = SpatialTransformer::new(vs.root(), 32, 4, 16, 32, 1);
        let xs = Tensor::randn([2, 32, 4, 4], (Kind::Float, Device::Cpu));
        let context = Tensor::randn([2, 7, 16], (Kind::Float, Device::Cpu));
        assert_eq!(st.forward(&xs, &context).size(), [2, 32, 4, 4]);
        let names = vs.variables();
        assert!(names.contains_key("transformer_blocks.0.attn2.to_k.weight"));
        assert!(names.contains_key("transformer_blocks.0.ff.net.0.proj.weight"));
        assert!(names.contains_key("transformer_blocks.0.attn1.to_out.0.bias"));
        assert!(!names.contains_key("transformer_blocks.0.attn1.to_q.bias"));
    }

    #[test]
    fn vae_attention_keeps_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let attn = VaeAttention::new(vs.root(), 32, 32, 1e-6);
        let xs = Tensor::randn([1, 32, 3, 5], (Kind::Float, Device::Cpu));
        assert_eq!(xs.apply(&attn).size(), [1, 32, 3, 5]);
    }
}
