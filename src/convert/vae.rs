//! VAE names of the LDM release to the names of [`crate::models::vae`].
use tch::Tensor;

fn join(prefix: &str, rest: &[&str]) -> String {
    if rest.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}.{}", rest.join("."))
    }
}

fn resnet(prefix: &str, rest: &[&str]) -> String {
    match rest {
        ["nin_shortcut", rest @ ..] => join(&format!("{prefix}.conv_shortcut"), rest),
        rest => join(prefix, rest),
    }
}

fn mid_block(parts: &[&str]) -> Option<String> {
    let name = match parts {
        ["block_1", rest @ ..] => resnet("mid_block.resnets.0", rest),
        ["block_2", rest @ ..] => resnet("mid_block.resnets.1", rest),
        ["attn_1", layer, rest @ ..] => {
            let layer = match *layer {
                "norm" => "group_norm",
                "q" => "query",
                "k" => "key",
                "v" => "value",
                "proj_out" => "proj_attn",
                _ => return None,
            };
            join(&format!("mid_block.attentions.0.{layer}"), rest)
        }
        _ => return None,
    };
    Some(name)
}

/// Renames a parameter found under `first_stage_model.encoder.`.
pub fn rename_encoder(name: &str) -> String {
    let parts: Vec<&str> = name.split('.').collect();
    let renamed = match parts.as_slice() {
        ["down", i, "block", j, rest @ ..] => Some(resnet(&format!("down_blocks.{i}.resnets.{j}"), rest)),
        ["down", i, "downsample", rest @ ..] => {
            Some(join(&format!("down_blocks.{i}.downsamplers.0"), rest))
        }
        ["mid", rest @ ..] => mid_block(rest),
        ["norm_out", rest @ ..] => Some(join("conv_norm_out", rest)),
        _ => None,
    };
    renamed.unwrap_or_else(|| name.to_string())
}

/// Renames a parameter found under `first_stage_model.decoder.`, the LDM
/// decoder numbers its levels from the highest resolution so the index is
/// reversed.
pub fn rename_decoder(name: &str, num_blocks: usize) -> String {
    let parts: Vec<&str> = name.split('.').collect();
    let reversed = |i: &str| -> Option<usize> { num_blocks.checked_sub(i.parse::<usize>().ok()? + 1) };
    let renamed = match parts.as_slice() {
        ["up", i, "block", j, rest @ ..] => {
            reversed(i).map(|i| resnet(&format!("up_blocks.{i}.resnets.{j}"), rest))
        }
        ["up", i, "upsample", rest @ ..] => {
            reversed(i).map(|i| join(&format!("up_blocks.{i}.upsamplers.0"), rest))
        }
        ["mid", rest @ ..] => mid_block(rest),
        ["norm_out", rest @ ..] => Some(join("conv_norm_out", rest)),
        _ => None,
    };
    renamed.unwrap_or_else(|| name.to_string())
}

/// The LDM attention projections are 1x1 convolutions, the models use linear
/// layers with weights of shape `[C, C]`.
pub fn adapt_tensor(name: &str, tensor: Tensor) -> Tensor {
    let is_projection = ["query", "key", "value", "proj_attn"]
        .iter()
        .any(|layer| name == format!("mid_block.attentions.0.{layer}.weight"));
    let size = tensor.size();
    if is_projection && size.len() == 4 {
        tensor.reshape([size[0], size[1]])
    } else {
        tensor
    }
}
