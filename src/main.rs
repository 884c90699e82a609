use anyhow::{Context, Result};
use clap::Parser;
use hunch::{learn, read_examples, Options};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Estimate unknown probabilities of a model from partial observations.
///
/// The model is a probabilistic logic program whose `t(...)`-annotated
/// probabilities are to be learned. Each example file holds observation
/// blocks of `evidence(atom, true|false).` lines, blocks separated by `---`
/// lines.
#[derive(Parser, Debug)]
#[command(name = "hunch")]
#[command(version)]
struct Cli {
    /// Model file
    model: PathBuf,

    /// One or more example files
    #[arg(required = true)]
    examples: Vec<PathBuf>,

    /// Maximum number of learning rounds
    #[arg(short = 'n', long, default_value_t = 10_000)]
    max_iterations: usize,

    /// Stop once a round improves the score by no more than this
    #[arg(short = 'd', long, default_value_t = 1e-10)]
    min_improvement: f64,

    /// Seed for initial weight draws (random when omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(serde::Serialize)]
struct Report {
    score: f64,
    iterations: usize,
    weights: Vec<ReportWeight>,
}

#[derive(serde::Serialize)]
struct ReportWeight {
    name: String,
    value: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hunch=info")),
        )
        .init();

    let cli = Cli::parse();
    let source = std::fs::read_to_string(&cli.model)
        .with_context(|| format!("reading model {}", cli.model.display()))?;
    let program = hunch::parse::model(&source)?;

    let mut examples = vec![];
    for path in &cli.examples {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading examples {}", path.display()))?;
        examples.extend(read_examples(&text)?);
    }

    let options = Options {
        max_iterations: cli.max_iterations,
        min_improvement: cli.min_improvement,
        seed: cli.seed.unwrap_or_else(rand::random),
    };
    let learned = learn(&program, &examples, &options)?;

    if cli.json {
        let report = Report {
            score: learned.score,
            iterations: learned.iterations,
            weights: learned
                .names
                .iter()
                .zip(&learned.weights)
                .map(|(name, value)| ReportWeight { name: name.to_string(), value: *value })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("score: {}", learned.score);
        println!("iterations: {}", learned.iterations);
        for (name, value) in learned.names.iter().zip(&learned.weights) {
            println!("{name}  ->  {value:.6}");
        }
    }
    Ok(())
}
