use thiserror::Error;

pub mod cli;
pub mod fs;
pub mod logging;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid root directory: {0}")]
    InvalidRootDir(String),
    #[error("invalid mount target: {0}")]
    InvalidTargetDir(String),
    #[error("target is not mounted: {0}")]
    NotMounted(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;

    // Initialize logging once the requested format is known. Parse failures
    // surface through the returned error instead of the subscriber.
    logging::init_logging(cli_args.log_format)?;
    cli::dispatch(cli_args)
}
