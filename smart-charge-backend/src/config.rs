use crate::{ha, load_balancing, logging, scheduler, state_of_charge, yaml};
use envconfig::Envconfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Envconfig)]
pub struct Environment {
    #[envconfig(from = "CONFIG_FILE")]
    pub config_file: PathBuf,

    #[envconfig(from = "SECRETS_FILE")]
    pub secrets_file: Option<PathBuf>,
}

fn load_file(filename: &Path) -> Result<serde_yml::Value, Error> {
    let f = std::fs::File::open(filename).map_err(|e| Error::File(filename.to_path_buf(), e))?;
    let config: serde_yml::Value =
        serde_yml::from_reader(f).map_err(|e| Error::Yaml(filename.to_path_buf(), e))?;

    Ok(config)
}

impl Environment {
    /// Load the config file, with the secrets file merged over it.
    ///
    /// # Errors
    ///
    /// If a file cannot be read or parsed, or the files cannot be merged.
    pub fn config(&self) -> Result<Config, Error> {
        let config = load_file(&self.config_file)?;

        let config = if let Some(secrets_file) = &self.secrets_file {
            let secrets = load_file(secrets_file)?;
            yaml::merge_yaml(config, secrets)?
        } else {
            config
        };

        let config: Config = serde_yml::from_value(config)
            .map_err(|e| Error::Yaml(self.config_file.clone(), e))?;

        Ok(config)
    }

    /// Load the environment from the environment variables.
    pub fn load() -> Result<Self, envconfig::Error> {
        Self::init_from_env()
    }
}

#[derive(Deserialize)]
pub struct Config {
    pub home_assistant: ha::Config,
    pub scheduler: scheduler::Config,
    pub state_of_charge: state_of_charge::Config,
    pub load_balancer: Option<load_balancing::Config>,
    pub logging: logging::Config,
}

/// An error loading the Config
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading the file
    #[error("Error reading file {0}: {1}")]
    File(PathBuf, std::io::Error),

    /// Error reading the file
    #[error("Error parsing file {0}: {1}")]
    Yaml(PathBuf, serde_yml::Error),

    /// Error merging the files
    #[error("Error merging files: {0}")]
    Merge(#[from] yaml::Error),
}
