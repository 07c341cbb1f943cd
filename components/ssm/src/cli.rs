use std::path::PathBuf;

use clap::Parser;

/// The session server manager: supervises a pool of per-application media
/// session server child processes.
#[derive(Debug, Parser)]
#[command(name = "ssm", version, about)]
pub struct Cli {
    /// Directory relative config-file arguments are resolved against.
    #[arg(long, env = "SSM_CONFIG_DIR", default_value = "/etc/ssm")]
    pub config_dir: PathBuf,

    /// Base configuration file. Must exist.
    #[arg(long, env = "SSM_BASE_CONFIG", default_value = "ssm.conf")]
    pub base_config: PathBuf,

    /// SoC-specific configuration file, layered over the base. Optional.
    #[arg(long, env = "SSM_SOC_CONFIG")]
    pub soc_config: Option<PathBuf>,

    /// Override configuration file, layered last. Optional.
    #[arg(long, env = "SSM_OVERRIDE_CONFIG")]
    pub override_config: Option<PathBuf>,
}

impl Cli {
    /// Resolves a possibly-relative config path against `config_dir`.
    /// Already-absolute paths pass through untouched.
    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }
}
