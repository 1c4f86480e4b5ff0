use std::path::PathBuf;

use clap::Args;
use feature_compiler::{FeatureSpec, PipelineIo};
use notebook_server::{ServerError, ServerResult};
use tracing::info;

#[derive(Args)]
pub struct CompileArgs {
    /// JSON file holding an array of feature specs
    features: PathBuf,
    /// Known source columns, comma separated; enables column checks
    #[arg(long, value_delimiter = ',')]
    schema: Option<Vec<String>>,
    /// Dataset to load; with --output, emits a complete pipeline script
    #[arg(long, requires = "output")]
    input: Option<String>,
    /// Where the pipeline writes the derived dataset
    #[arg(long, requires = "input")]
    output: Option<String>,
}

pub async fn run_compile(args: CompileArgs) -> ServerResult<()> {
    let content = tokio::fs::read(&args.features)
        .await
        .map_err(|e| ServerError::Config(format!("read {}: {e}", args.features.display())))?;
    let features: Vec<FeatureSpec> = serde_json::from_slice(&content)?;

    let script = match (args.input, args.output) {
        (Some(input), Some(output)) => {
            let mut io = PipelineIo::new(input, output);
            io.schema = args.schema;
            feature_compiler::compile_pipeline(&features, &io)?
        }
        _ => match args.schema {
            Some(columns) => feature_compiler::compile_with_schema(&features, columns)?,
            None => feature_compiler::compile(&features)?,
        },
    };

    info!(features = features.len(), digest = %script.digest(), "compiled");
    print!("{script}");
    Ok(())
}
