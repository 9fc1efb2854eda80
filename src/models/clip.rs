//! Contrastive Language-Image Pre-Training
//!
//! The text half of CLIP, turning prompt tokens into the embeddings that the
//! UNet attends to. Tokenization happens upstream, this model consumes token
//! ids directly.
//!
//! https://github.com/openai/CLIP
use tch::{nn, nn::Module, Device, Kind, Tensor};

#[derive(Debug, Clone)]
pub struct Config {
    pub vocab_size: i64,
    pub embed_dim: i64, // aka config.hidden_size
    pub intermediate_size: i64,
    pub max_position_embeddings: i64,
    pub num_hidden_layers: i64,
    pub num_attention_heads: i64,
}

impl Config {
    // The config details can be found in the "text_config" section of this json file:
    // https://huggingface.co/openai/clip-vit-large-patch14/blob/main/config.json
    pub fn v1_5() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 768,
            intermediate_size: 3072,
            max_position_embeddings: 77,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        }
    }
}

#[derive(Debug)]
struct Embeddings {
    token_embedding: nn::Embedding,
    position_embedding: nn::Embedding,
}

impl Embeddings {
    fn new(vs: nn::Path, c: &Config) -> Self {
        let token_embedding =
            nn::embedding(&vs / "token_embedding", c.vocab_size, c.embed_dim, Default::default());
        let position_embedding = nn::embedding(
            &vs / "position_embedding",
            c.max_position_embeddings,
            c.embed_dim,
            Default::default(),
        );
        Self { token_embedding, position_embedding }
    }
}

impl Module for Embeddings {
    fn forward(&self, xs: &Tensor) -> Tensor {
        // Position ids are not parameters, they are rebuilt for every input.
        let seq_len = xs.size()[1];
        let position_ids = Tensor::arange(seq_len, (Kind::Int64, xs.device())).unsqueeze(0);
        xs.apply(&self.token_embedding) + position_ids.apply(&self.position_embedding)
    }
}

#[derive(Debug)]
struct SelfAttention {
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
    heads: i64,
    scale: f64,
}

impl SelfAttention {
    fn new(vs: nn::Path, c: &Config) -> Self {
        let dim = c.embed_dim;
        let q_proj = nn::linear(&vs / "q_proj", dim, dim, Default::default());
        let k_proj = nn::linear(&vs / "k_proj", dim, dim, Default::default());
        let v_proj = nn::linear(&vs / "v_proj", dim, dim, Default::default());
        let out_proj = nn::linear(&vs / "out_proj", dim, dim, Default::default());
        let heads = c.num_attention_heads;
        let scale = ((dim / heads) as f64).powf(-0.5);
        Self { q_proj, k_proj, v_proj, out_proj, heads, scale }
    }

    // (b, n, dim) -> (b, heads, n, dim / heads)
    fn split_heads(&self, xs: &Tensor) -> Tensor {
        let dims = xs.size();
        xs.view((dims[0], dims[1], self.heads, -1)).transpose(1, 2)
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Tensor {
        let dims = xs.size();
        let q = self.split_heads(&(xs.apply(&self.q_proj) * self.scale));
        let k = self.split_heads(&xs.apply(&self.k_proj));
        let v = self.split_heads(&xs.apply(&self.v_proj));
        let attn = (q.matmul(&k.transpose(-1, -2)) + causal_mask).softmax(-1, Kind::Float);
        attn.matmul(&v).transpose(1, 2).reshape([dims[0], dims[1], dims[2]]).apply(&self.out_proj)
    }
}

#[derive(Debug)]
struct Mlp {
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl Mlp {
    fn new(vs: nn::Path, c: &Config) -> Self {
        let fc1 = nn::linear(&vs / "fc1", c.embed_dim, c.intermediate_size, Default::default());
        let fc2 = nn::linear(&vs / "fc2", c.intermediate_size, c.embed_dim, Default::default());
        Self { fc1, fc2 }
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        // quick_gelu, as in hidden_act
        let xs = xs.apply(&self.fc1);
        (&xs * (&xs * 1.702).sigmoid()).apply(&self.fc2)
    }
}

#[derive(Debug)]
struct EncoderLayer {
    self_attn: SelfAttention,
    layer_norm1: nn::LayerNorm,
    mlp: Mlp,
    layer_norm2: nn::LayerNorm,
}

impl EncoderLayer {
    fn new(vs: nn::Path, c: &Config) -> Self {
        let self_attn = SelfAttention::new(&vs / "self_attn", c);
        let layer_norm1 =
            nn::layer_norm(&vs / "layer_norm1", vec![c.embed_dim], Default::default());
        let mlp = Mlp::new(&vs / "mlp", c);
        let layer_norm2 =
            nn::layer_norm(&vs / "layer_norm2", vec![c.embed_dim], Default::default());
        Self { self_attn, layer_norm1, mlp, layer_norm2 }
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Tensor {
        let xs = self.self_attn.forward(&xs.apply(&self.layer_norm1), causal_mask) + xs;
        xs.apply(&self.layer_norm2).apply(&self.mlp) + xs
    }
}

/// A CLIP transformer based model, all its parameters live under `text_model`.
#[derive(Debug)]
pub struct ClipTextTransformer {
    embeddings: Embeddings,
    layers: Vec<EncoderLayer>,
    final_layer_norm: nn::LayerNorm,
}

impl ClipTextTransformer {
    pub fn new(vs: nn::Path, c: &Config) -> Self {
        let vs = &vs / "text_model";
        let embeddings = Embeddings::new(&vs / "embeddings", c);
        let vs_layers = &vs / "encoder" / "layers";
        let layers = (0..c.num_hidden_layers).map(|i| EncoderLayer::new(&vs_layers / i, c)).collect();
        let final_layer_norm =
            nn::layer_norm(&vs / "final_layer_norm", vec![c.embed_dim], Default::default());
        Self { embeddings, layers, final_layer_norm }
    }

    // Tokens can only attend to themselves and to the tokens before them.
    fn causal_mask(seq_len: i64, device: Device) -> Tensor {
        Tensor::full([seq_len, seq_len], f32::MIN as f64, (Kind::Float, device)).triu(1)
    }
}

impl Module for ClipTextTransformer {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let seq_len = xs.size()[1];
        let mut xs = xs.apply(&self.embeddings);
        let causal_mask = Self::causal_mask(seq_len, xs.device());
        for layer in self.layers.iter() {
            xs = layer.forward(&xs, &causal_mask)
        }
        xs.apply(&self.final_layer_norm)
    }
}
