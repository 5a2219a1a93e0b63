use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_HOST: &str = "play.wordgrab.net";
pub const DEFAULT_PORT: u16 = 5144;

#[derive(Serialize, Deserialize)]
pub struct Net {
    pub host: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize)]
pub struct RunnerConfig {
    pub net: Net,
}

impl Default for RunnerConfig {
    fn default() -> RunnerConfig {
        RunnerConfig {
            net: Net {
                host: DEFAULT_HOST.to_owned(),
                port: DEFAULT_PORT,
            },
        }
    }
}

impl RunnerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<RunnerConfig, String> {
        serdeconv::from_toml_file(path.as_ref())
            .map_err(|err| format!("Error loading config file {:?}: {}", path.as_ref(), err))
    }
}
