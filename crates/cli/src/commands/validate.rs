//! Validate Command

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;

use storysnap_common::config::DEFAULT_CONFIG_FILE;
use storysnap_common::GlobalConfig;

use crate::output::{print_error, print_success, OutputFormat};

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}

/// One line per problem, ordered by path
pub fn report(config: &Path) -> Result<Vec<String>> {
    if !config.exists() {
        anyhow::bail!("{} does not exist", config.display());
    }
    let (_, errors) = GlobalConfig::load(config)?;
    Ok(errors
        .sorted()
        .into_iter()
        .map(|e| format!("{}: {}", e.path, e.message))
        .collect())
}

pub async fn execute(args: ValidateArgs, format: OutputFormat) -> Result<()> {
    let problems = report(&args.config)?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&problems)?);
    } else if problems.is_empty() {
        print_success(&format!("{} is valid", args.config.display()));
    } else {
        for problem in &problems {
            print_error(problem);
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} invalid option(s) in {}", problems.len(), args.config.display())
    }
}
