use std::path::PathBuf;
use structopt::StructOpt;

/// Something about the macros used by `structopt` mean the return from
/// `from_args()` is <unknown> in code editors without a type ascription or
/// some other hint. This function provides such a hint.
pub fn parse_args() -> Opt {
    Opt::from_args()
}

#[derive(StructOpt)]
pub struct Opt {
    #[structopt(
        long,
        parse(from_os_str),
        default_value = "./config.yml",
        env = "LAGOON_CONFIG",
        help = "Path to the yaml config file."
    )]
    pub config: PathBuf,
}
