// Loads a Stable Diffusion v1.x checkpoint and reports the size of its models.
//
// Both the single file releases (e.g. v1-5-pruned-emaonly.safetensors from
// https://huggingface.co/runwayml/stable-diffusion-v1-5) and the files written
// with `--save` can be used:
//
//   cargo run --release --features cli --example load-models -- \
//     --checkpoint data/v1-5-pruned-emaonly.safetensors --save data/sd-v1-5.safetensors
//
// Set RUST_LOG=debug to see how the tensors are routed.
use clap::Parser;
use sd_loader::{DeviceSetup, ModelKind, StableDiffusionConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The checkpoint to load.
    #[arg(long, value_name = "FILE")]
    checkpoint: String,

    /// The device used for the models not listed in --cpu: cpu, cuda, cuda:N, mps or auto.
    #[arg(long, default_value = "auto")]
    device: String,

    /// Models to keep on the CPU, can be repeated: clip, encoder, decoder, diffusion or all.
    #[arg(long, value_parser = ["all", "clip", "encoder", "decoder", "diffusion"])]
    cpu: Vec<String>,

    /// Write the loaded models back as a single partitioned safetensors file.
    #[arg(long, value_name = "FILE")]
    save: Option<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    println!("Cuda available: {}", tch::Cuda::is_available());

    let devices = DeviceSetup::new(&args.device, args.cpu)?;
    let config = StableDiffusionConfig::v1_5();
    let models = config.load_models(&args.checkpoint, &devices)?;
    for kind in ModelKind::ALL {
        let vs = models.var_store(kind);
        let n: i64 = vs.variables().values().map(|t| t.numel() as i64).sum();
        println!("{kind:>9}: {:>4} tensors, {n:>10} parameters on {:?}", vs.len(), vs.device());
    }

    if let Some(save) = args.save {
        models.save(&save)?;
        println!("Saved to {save}");
    }
    Ok(())
}
