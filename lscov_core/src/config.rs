use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LscovConfig {
    /// Seconds between tally snapshots.
    #[serde(default = "default_tally_period_secs")]
    pub tally_period_secs: u64,
    /// Bloom filter size in bytes.
    #[serde(default = "default_filter_size_bytes")]
    pub filter_size_bytes: usize,
    /// Number of hash functions per fingerprint.
    #[serde(default = "default_num_hashes")]
    pub num_hashes: u32,
    /// Where the coverage time series is written.
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    /// Error-bound percentage for the report; 0 disables bound columns.
    #[serde(default)]
    pub error_percent: u8,
}

pub fn default_tally_period_secs() -> u64 {
    10
}

pub fn default_filter_size_bytes() -> usize {
    0x400_0000
}

pub fn default_num_hashes() -> u32 {
    4
}

pub fn default_output_path() -> PathBuf {
    PathBuf::from("lscov.csv")
}

impl Default for LscovConfig {
    fn default() -> Self {
        Self {
            tally_period_secs: default_tally_period_secs(),
            filter_size_bytes: default_filter_size_bytes(),
            num_hashes: default_num_hashes(),
            output_path: default_output_path(),
            error_percent: 0,
        }
    }
}

impl LscovConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: LscovConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.tally_period_secs == 0 {
            anyhow::bail!("tally-period-secs must be at least 1");
        }
        if self.filter_size_bytes == 0 || self.filter_size_bytes % 8 != 0 {
            anyhow::bail!(
                "filter-size-bytes must be a nonzero multiple of 8, got {}",
                self.filter_size_bytes
            );
        }
        if self.num_hashes == 0 {
            anyhow::bail!("num-hashes must be at least 1");
        }
        if self.error_percent > 100 {
            anyhow::bail!("error-percent must be within 0..=100");
        }
        Ok(())
    }
}
