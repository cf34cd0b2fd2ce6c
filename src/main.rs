//! `pixelasg` command line: evaluate a PixelCNN loss or sample an image from
//! mixture parameters stored in a SafeTensors file.

use clap::{Parser, Subcommand};
use pixelasg::asg::Value;
use pixelasg::config::PixelCnnConfig;
use pixelasg::error::PixelCnnError;
use pixelasg::pixelcnn::{self, LossInputs, LossKind, INPUT_NORM, TARGET, Z};
use pixelasg::serialization::{load_safetensors, save_safetensors};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Parser, Debug)]
#[command(author, version, about = "PixelCNN likelihoods and sampling on an ASG", long_about = None)]
struct Args {
    /// JSON file with a `PixelCnnConfig`; defaults to 3x32x32, 256 levels, 10 components.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate the NLL of `input_norm`/`target` under the network output `z`.
    Loss {
        /// `category` or `mixture`.
        #[arg(short, long)]
        kind: String,
        /// SafeTensors file holding `z` and `input_norm` or `target`.
        #[arg(short, long)]
        tensors: PathBuf,
        /// Write `d loss / d z` to this SafeTensors file as `grad_z`.
        #[arg(long)]
        grad: Option<PathBuf>,
    },
    /// Draw one image from the mixture parameters `z`.
    Sample {
        #[arg(short, long)]
        tensors: PathBuf,
        /// Output SafeTensors file; the image is stored as `image`.
        #[arg(short, long)]
        out: PathBuf,
        #[arg(short, long)]
        seed: Option<u64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    Registry::default().with(filter).with(fmt_layer).init();
}

fn take(tensors: &mut HashMap<String, Value>, name: &str) -> Option<ndarray::ArrayD<f32>> {
    tensors.remove(name).map(Value::into_tensor)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PixelCnnConfig::from_json_file(path)?,
        None => PixelCnnConfig::default(),
    };
    info!(?config, "configuration");

    match args.command {
        Command::Loss { kind, tensors, grad } => {
            let kind: LossKind = kind.parse()?;
            let mut data = load_safetensors(&tensors)?;
            let z = take(&mut data, Z).ok_or(PixelCnnError::MissingTensor(Z))?;
            let inputs = LossInputs {
                input_norm: take(&mut data, INPUT_NORM),
                target: take(&mut data, TARGET),
                z,
            };

            let report = pixelcnn::evaluate_loss(kind, &inputs, &config, grad.is_some())?;
            info!(kind = %report.kind, loss = report.loss, bits_per_dim = report.bits_per_dim, "loss");
            println!("{}: loss = {:.6} nats, {:.4} bits/dim", report.kind, report.loss, report.bits_per_dim);

            if let (Some(path), Some(grad_z)) = (grad, report.grad_z) {
                let out = HashMap::from([("grad_z".to_string(), Value::Tensor(grad_z))]);
                save_safetensors(&path, &out)?;
                info!(path = %path.display(), "gradient written");
            }
        }
        Command::Sample { tensors, out, seed } => {
            let mut data = load_safetensors(&tensors)?;
            let z = take(&mut data, Z).ok_or(PixelCnnError::MissingTensor(Z))?;
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };

            let image = pixelcnn::sample_image(&z, &config, &mut rng)?;
            info!(shape = ?image.shape(), "image sampled");
            let out_map = HashMap::from([("image".to_string(), Value::Tensor(image))]);
            save_safetensors(&out, &out_map)?;
            info!(path = %out.display(), "image written");
        }
    }
    Ok(())
}
