//! UNet names of the LDM release (`input_blocks`, `middle_block`,
//! `output_blocks`) to the hierarchical names used by [`crate::models::unet`].
//!
//! The LDM layout numbers its blocks with a flat index. On the way down each
//! level holds `layers_per_block` residual blocks followed by a downsampler,
//! on the way up `layers_per_block + 1` residual blocks with the upsampler
//! attached to the last one.

/// Renames a parameter found under `model.diffusion_model.`. Names that do
/// not follow the LDM layout are returned unchanged.
pub fn rename(name: &str, layers_per_block: usize) -> String {
    let parts: Vec<&str> = name.split('.').collect();
    rename_parts(&parts, layers_per_block).unwrap_or_else(|| name.to_string())
}

fn join(prefix: &str, rest: &[&str]) -> String {
    if rest.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}.{}", rest.join("."))
    }
}

// in_layers/emb_layers/out_layers are sequentials, only the indexes holding
// parameters are mapped.
fn resnet(prefix: &str, rest: &[&str]) -> Option<String> {
    let (name, rest) = match rest {
        ["in_layers", "0", rest @ ..] => ("norm1", rest),
        ["in_layers", "2", rest @ ..] => ("conv1", rest),
        ["emb_layers", "1", rest @ ..] => ("time_emb_proj", rest),
        ["out_layers", "0", rest @ ..] => ("norm2", rest),
        ["out_layers", "3", rest @ ..] => ("conv2", rest),
        ["skip_connection", rest @ ..] => ("conv_shortcut", rest),
        _ => return None,
    };
    Some(join(&format!("{prefix}.{name}"), rest))
}

fn rename_parts(parts: &[&str], layers_per_block: usize) -> Option<String> {
    let stride = layers_per_block + 1;
    match parts {
        ["time_embed", "0", rest @ ..] => Some(join("time_embedding.linear_1", rest)),
        ["time_embed", "2", rest @ ..] => Some(join("time_embedding.linear_2", rest)),
        ["input_blocks", "0", "0", rest @ ..] => Some(join("conv_in", rest)),
        ["input_blocks", n, sub, rest @ ..] => {
            let n = n.parse::<usize>().ok()?.checked_sub(1)?;
            let (i, j) = (n / stride, n % stride);
            match (*sub, rest) {
                ("0", ["op", rest @ ..]) if j == layers_per_block => {
                    Some(join(&format!("down_blocks.{i}.downsamplers.0.conv"), rest))
                }
                ("0", rest) => resnet(&format!("down_blocks.{i}.resnets.{j}"), rest),
                ("1", rest) => Some(join(&format!("down_blocks.{i}.attentions.{j}"), rest)),
                _ => None,
            }
        }
        ["middle_block", "0", rest @ ..] => resnet("mid_block.resnets.0", rest),
        ["middle_block", "1", rest @ ..] => Some(join("mid_block.attentions.0", rest)),
        ["middle_block", "2", rest @ ..] => resnet("mid_block.resnets.1", rest),
        ["output_blocks", n, sub, rest @ ..] => {
            let n = n.parse::<usize>().ok()?;
            let (i, j) = (n / stride, n % stride);
            match (*sub, rest) {
                ("0", rest) => resnet(&format!("up_blocks.{i}.resnets.{j}"), rest),
                // Levels without attention put the upsampler right after the resnet.
                ("1", ["conv", ..]) | ("2", _) => {
                    Some(join(&format!("up_blocks.{i}.upsamplers.0"), rest))
                }
                ("1", rest) => Some(join(&format!("up_blocks.{i}.attentions.{j}"), rest)),
                _ => None,
            }
        }
        ["out", "0", rest @ ..] => Some(join("conv_norm_out", rest)),
        ["out", "2", rest @ ..] => Some(join("conv_out", rest)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::rename;

    #[test]
    fn sd_v1_5_names() {
        let cases = [
            ("time_embed.0.weight", "time_embedding.linear_1.weight"),
            ("time_embed.2.bias", "time_embedding.linear_2.bias"),
            ("input_blocks.0.0.weight", "conv_in.weight"),
            ("input_blocks.1.0.in_layers.0.weight", "down_blocks.0.resnets.0.norm1.weight"),
            ("input_blocks.2.0.emb_layers.1.bias", "down_blocks.0.resnets.1.time_emb_proj.bias"),
            ("input_blocks.3.0.op.weight", "down_blocks.0.downsamplers.0.conv.weight"),
            ("input_blocks.4.0.skip_connection.weight", "down_blocks.1.resnets.0.conv_shortcut.weight"),
            (
                "input_blocks.4.1.transformer_blocks.0.attn2.to_k.weight",
                "down_blocks.1.attentions.0.transformer_blocks.0.attn2.to_k.weight",
            ),
            ("input_blocks.11.0.out_layers.3.weight", "down_blocks.3.resnets.1.conv2.weight"),
            ("middle_block.0.in_layers.2.weight", "mid_block.resnets.0.conv1.weight"),
            ("middle_block.1.proj_in.bias", "mid_block.attentions.0.proj_in.bias"),
            ("middle_block.2.out_layers.0.bias", "mid_block.resnets.1.norm2.bias"),
            ("output_blocks.0.0.in_layers.0.weight", "up_blocks.0.resnets.0.norm1.weight"),
            ("output_blocks.2.1.conv.weight", "up_blocks.0.upsamplers.0.conv.weight"),
            ("output_blocks.3.1.norm.weight", "up_blocks.1.attentions.0.norm.weight"),
            ("output_blocks.5.2.conv.bias", "up_blocks.1.upsamplers.0.conv.bias"),
            ("output_blocks.11.1.proj_out.weight", "up_blocks.3.attentions.2.proj_out.weight"),
            ("out.0.weight", "conv_norm_out.weight"),
            ("out.2.bias", "conv_out.bias"),
        ];
        for (ldm, expected) in cases {
            assert_eq!(rename(ldm, 2), expected, "{ldm}");
        }
    }

    #[test]
    fn layers_per_block_sets_the_stride() {
        assert_eq!(rename("input_blocks.2.0.op.weight", 1), "down_blocks.0.downsamplers.0.conv.weight");
        assert_eq!(rename("input_blocks.3.0.in_layers.0.bias", 1), "down_blocks.1.resnets.0.norm1.bias");
        assert_eq!(rename("output_blocks.2.0.in_layers.2.weight", 1), "up_blocks.1.resnets.0.conv1.weight");
    }

    #[test]
    fn unknown_names_pass_through() {
        assert_eq!(rename("label_emb.0.0.weight", 2), "label_emb.0.0.weight");
        assert_eq!(rename("input_blocks.1.0.in_layers.1.weight", 2), "input_blocks.1.0.in_layers.1.weight");
    }
}
